use rand::Rng;
use std::time::Duration;

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Gateway instance names are the display name, lowercased, with whitespace
/// runs collapsed into `_`.
pub fn instance_name_for(display_name: &str) -> String {
    display_name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Placeholder handle for chips registered without a number.
pub fn generate_phone() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..100_000_000);
    format!("+5511{:08}", n)
}

pub fn random_interval(min_secs: u64, max_secs: u64) -> Duration {
    let (lo, hi) = if min_secs <= max_secs { (min_secs, max_secs) } else { (max_secs, min_secs) };
    let ms = rand::thread_rng().gen_range(lo.saturating_mul(1000)..=hi.saturating_mul(1000));
    Duration::from_millis(ms)
}
