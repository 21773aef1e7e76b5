use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;

const HEADER: &str =
    "timestamp_iso8601,amount_sat,fee_sat,fee_ppm,from_chan_id,to_chan_id,route_hops\n";

/// Append one successful rebalance to the stats CSV, creating the file with
/// a header row first if needed.
pub fn record_success(
    path: &str,
    amount_sat: i64,
    fee_msat: i64,
    from_chan: u64,
    to_chan: u64,
    route_hops: usize,
) -> anyhow::Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    let new_file = !Path::new(path).exists();
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open stats file {}", path))?;
    if new_file {
        f.write_all(HEADER.as_bytes())?;
    }
    let fee_ppm = if amount_sat > 0 {
        fee_msat * 1000 / amount_sat
    } else {
        0
    };
    writeln!(
        f,
        "{},{},{:.3},{},{},{},{}",
        Utc::now().to_rfc3339(),
        amount_sat,
        fee_msat as f64 / 1000.0,
        fee_ppm,
        from_chan,
        to_chan,
        route_hops
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("lnbalancer-stats-{}-{}.csv", name, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_header_written_once() {
        let path = tmp_path("header");
        std::fs::remove_file(&path).ok();
        record_success(&path, 100_000, 51_000, 1, 2, 3).unwrap();
        record_success(&path, 50_000, 26_000, 1, 2, 3).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp_iso8601,amount_sat"));
        assert!(lines[1].contains(",100000,51.000,510,1,2,3"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_empty_path_is_noop() {
        record_success("", 100_000, 51_000, 1, 2, 3).unwrap();
    }
}
