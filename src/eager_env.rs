use std::env;
use std::sync::LazyLock;

macro_rules! define_env_vars {
    ($(($name:ident, $env_name:expr, $type:ty, $default:expr)),* $(,)?) => {
        $(
            pub static $name: LazyLock<$type> = LazyLock::new(|| {
                let Ok(val) = env::var($env_name) else {
                    return $default.into();
                };
                val.parse::<$type>().unwrap_or_else(|_| {
                    panic!(
                        "Failed to parse environment variable {} with value '{}' as {}",
                        $env_name,
                        val,
                        stringify!($type)
                    )
                })
            });
        )*

        /// Force initialization of all environment variables at startup
        /// Call this early in main() to fail fast if any env var is malformed
        pub fn check_env() {
            $(
                let _ = *$name;
            )*
        }
    };
}

define_env_vars!(
    (MAX_BUCKETS, "POOL_MAX_BUCKETS", usize, 1024usize),
    (START_HEARTBEAT_MS, "POOL_START_HEARTBEAT_MS", u64, 10_000u64),
    (IDENTIFICATION_MS, "POOL_IDENTIFICATION_MS", u64, 5_000u64),
    (ACTIVE_HEARTBEAT_MS, "POOL_ACTIVE_HEARTBEAT_MS", u64, 5_000u64),
    (INTER_HEARTBEAT_MS, "POOL_INTER_HEARTBEAT_MS", u64, 15_000u64),
    (REACTIVATE_MS, "POOL_REACTIVATE_MS", u64, 50_000u64),
    (OFFLINE_QUEUE_LIMIT, "POOL_OFFLINE_QUEUE_LIMIT", usize, 1000usize),
    (OFFLINE_AGE_MS, "POOL_OFFLINE_AGE_MS", u64, 60_000u64),
    (FORWARD_MAX_HOPS, "POOL_FORWARD_MAX_HOPS", u32, 5u32),
    (HOSTS, "POOL_HOSTS", usize, 3usize),
    (REQUEST_FIELD, "POOL_REQUEST_FIELD", String, "request_id"),
);
