use anyhow::{Result, bail};
use rayon::ThreadPoolBuilder;
use std::sync::Once;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

struct ThreadConfig {
    count: usize,
    source: String,
}

fn parse_env_threads(keys: &[&str]) -> Option<ThreadConfig> {
    for &key in keys {
        if let Ok(v) = std::env::var(key) {
            if let Ok(val) = v.parse::<usize>() {
                if val > 0 {
                    return Some(ThreadConfig {
                        count: val,
                        source: key.to_string(),
                    });
                }
            }
        }
    }
    None
}

fn detect_thread_config() -> ThreadConfig {
    const ENV_HINTS: [&str; 6] = [
        "LIGHTCONE_THREADS",
        "RAYON_NUM_THREADS",
        "SLURM_CPUS_PER_TASK",
        "SLURM_CPUS_ON_NODE",
        "PBS_NP",
        "OMP_NUM_THREADS",
    ];

    if let Some(cfg) = parse_env_threads(&ENV_HINTS) {
        return cfg;
    }

    let fallback = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1);

    ThreadConfig {
        count: fallback,
        source: "available_parallelism".to_string(),
    }
}

pub fn configure_thread_pool() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let cfg = detect_thread_config();
        match ThreadPoolBuilder::new()
            .num_threads(cfg.count)
            .thread_name(|i| format!("lightcone-worker-{i}"))
            .build_global()
        {
            Ok(_) => {
                tracing::info!(threads = cfg.count, hint = %cfg.source, "rayon pool configured");
            }
            Err(err) => {
                tracing::warn!("failed to configure rayon pool ({err}); continuing with default");
            }
        }
    });
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// Install the stderr subscriber. `LIGHTCONE_LOG` overrides the level picked
/// from `-v` flags.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LIGHTCONE_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

// -------------------------------------------------------------------------------------
// Memory tracking (HPC safety)
// -------------------------------------------------------------------------------------

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

fn parse_budget(raw: Option<String>, multiplier: u64) -> Option<u64> {
    let raw = raw?;
    if raw.trim().is_empty() {
        return None;
    }
    raw.trim()
        .parse::<u64>()
        .ok()
        .map(|v| v.saturating_mul(multiplier))
}

pub fn memory_budget_bytes() -> Option<u64> {
    let var = |k: &str| std::env::var(k).ok();
    parse_budget(var("LIGHTCONE_MAX_RSS_BYTES"), 1)
        .or_else(|| parse_budget(var("LIGHTCONE_MAX_RSS_MB"), MB))
        .or_else(|| parse_budget(var("LIGHTCONE_MAX_RSS_GB"), GB))
}

fn current_rss_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut parts = contents.split_whitespace();
    let _total = parts.next()?;
    let resident_pages: u64 = parts.next()?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages.saturating_mul(page_size as u64))
}

fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

fn check_budget(rss: u64, budget: Option<u64>) -> Result<()> {
    if let Some(limit) = budget {
        if rss > limit {
            bail!(
                "RSS {:.2} GiB exceeded limit {:.2} GiB (set via LIGHTCONE_MAX_RSS_*)",
                bytes_to_gib(rss),
                bytes_to_gib(limit)
            );
        }
    }
    Ok(())
}

/// Log resident memory after an epoch and fail once it passes the budget.
pub fn report_memory(z: f64, budget: Option<u64>) -> Result<()> {
    if let Some(rss) = current_rss_bytes() {
        match budget {
            Some(limit) => tracing::info!(
                z,
                rss_gib = format_args!("{:.2}", bytes_to_gib(rss)),
                limit_gib = format_args!("{:.2}", bytes_to_gib(limit)),
                "memory"
            ),
            None => tracing::info!(z, rss_gib = format_args!("{:.2}", bytes_to_gib(rss)), "memory"),
        }
        check_budget(rss, budget)?;
    }
    Ok(())
}
