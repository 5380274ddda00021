use std::env;
use tracing::warn;

/// Where appointment rows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Supabase,
}

/// Where sequence counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceBackend {
    Memory,
    Redis,
    Supabase,
}

/// Which counter a doctor queue number is drawn from. Chosen once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueScope {
    #[default]
    PerDoctor,
    PerDoctorDate,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_service_key: Option<String>,
    pub redis_url: Option<String>,
    pub store_backend: StoreBackend,
    pub sequence_backend: SequenceBackend,
    pub queue_scope: QueueScope,
    pub backfill_on_read: bool,
    pub backfill_interval_secs: u64,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let supabase_url = env::var("SUPABASE_URL").unwrap_or_else(|_| {
            warn!("SUPABASE_URL not set, using empty value");
            String::new()
        });
        let supabase_anon_key = env::var("SUPABASE_ANON_PUBLIC_KEY").unwrap_or_else(|_| {
            warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
            String::new()
        });
        let supabase_jwt_secret = env::var("SUPABASE_JWT_SECRET").unwrap_or_else(|_| {
            warn!("SUPABASE_JWT_SECRET not set, using empty value");
            String::new()
        });
        let supabase_service_key = env::var("SUPABASE_SERVICE_ROLE_KEY")
            .ok()
            .filter(|key| !key.is_empty());
        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

        let supabase_ready = !supabase_url.is_empty() && !supabase_anon_key.is_empty();

        let store_backend = match env::var("BOOKING_STORE").as_deref() {
            Ok("supabase") => StoreBackend::Supabase,
            Ok("memory") => StoreBackend::Memory,
            Ok(other) => {
                warn!("Unknown BOOKING_STORE '{}', falling back to default", other);
                Self::default_store(supabase_ready)
            }
            Err(_) => Self::default_store(supabase_ready),
        };

        let sequence_backend = match env::var("SEQUENCE_BACKEND").as_deref() {
            Ok("redis") => SequenceBackend::Redis,
            Ok("supabase") => SequenceBackend::Supabase,
            Ok("memory") => SequenceBackend::Memory,
            Ok(other) => {
                warn!("Unknown SEQUENCE_BACKEND '{}', following the booking store", other);
                Self::sequence_for_store(store_backend)
            }
            Err(_) => Self::sequence_for_store(store_backend),
        };

        let queue_scope = match env::var("DOCTOR_QUEUE_SCOPE").as_deref() {
            Ok("doctor_date") => QueueScope::PerDoctorDate,
            Ok("doctor") | Err(_) => QueueScope::PerDoctor,
            Ok(other) => {
                warn!("Unknown DOCTOR_QUEUE_SCOPE '{}', using per-doctor queues", other);
                QueueScope::PerDoctor
            }
        };

        let backfill_on_read = env::var("BACKFILL_ON_READ")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let backfill_interval_secs = env::var("QUEUE_BACKFILL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let config = Self {
            supabase_url,
            supabase_anon_key,
            supabase_jwt_secret,
            supabase_service_key,
            redis_url,
            store_backend,
            sequence_backend,
            queue_scope,
            backfill_on_read,
            backfill_interval_secs,
            port,
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    fn default_store(supabase_ready: bool) -> StoreBackend {
        if supabase_ready {
            StoreBackend::Supabase
        } else {
            StoreBackend::Memory
        }
    }

    fn sequence_for_store(store: StoreBackend) -> SequenceBackend {
        match store {
            StoreBackend::Supabase => SequenceBackend::Supabase,
            StoreBackend::Memory => SequenceBackend::Memory,
        }
    }

    pub fn is_configured(&self) -> bool {
        let store_ok = match self.store_backend {
            StoreBackend::Memory => true,
            StoreBackend::Supabase => {
                !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
            }
        };
        let sequence_ok = match self.sequence_backend {
            SequenceBackend::Redis => self.redis_url.is_some(),
            _ => true,
        };

        store_ok && sequence_ok && !self.supabase_jwt_secret.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            supabase_service_key: None,
            redis_url: None,
            store_backend: StoreBackend::Memory,
            sequence_backend: SequenceBackend::Memory,
            queue_scope: QueueScope::PerDoctor,
            backfill_on_read: true,
            backfill_interval_secs: 0,
            port: 3000,
        }
    }
}
