//! `perf stat -e LLC-loads,LLC-load-misses,LLC-stores,LLC-store-misses`.
use super::{parse_number, ParseError};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub loads: u64,
    pub load_misses: u64,
    pub stores: u64,
    pub store_misses: u64,
}

impl CacheStats {
    /// LLC misses over LLC accesses, in percent.
    pub fn miss_ratio(&self) -> f64 {
        let accesses = self.loads + self.stores;
        if accesses == 0 {
            return 0.0;
        }
        (self.load_misses + self.store_misses) as f64 * 100.0 / accesses as f64
    }
}

pub fn parse_perf_stat(lines: &[String]) -> Result<CacheStats, ParseError> {
    let mut stats = CacheStats::default();
    let mut seen = 0;
    for line in lines {
        let mut tokens = line.split_whitespace();
        let (count, event) = match (tokens.next(), tokens.next()) {
            (Some(count), Some(event)) => (count, event),
            _ => continue,
        };
        let field = match event {
            "LLC-loads" => &mut stats.loads,
            "LLC-load-misses" => &mut stats.load_misses,
            "LLC-stores" => &mut stats.stores,
            "LLC-store-misses" => &mut stats.store_misses,
            _ => continue,
        };
        // `<not supported>` and `<not counted>` leave the counter at zero
        if let Some(value) = parse_number(count) {
            *field = value as u64;
            seen += 1;
        }
    }
    if seen == 0 || stats.loads + stats.stores == 0 {
        return Err(ParseError::missing("LLC access counter", lines));
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llc_counters() {
        let out: Vec<String> = " Performance counter stats for 'CPU(s) 0,1,4,5':

         8,000,000      LLC-loads
         1,000,000      LLC-load-misses           #   12.50% of all LL-cache accesses
         2,000,000      LLC-stores
         1,000,000      LLC-store-misses

      20.004123117 seconds time elapsed"
            .lines()
            .map(str::to_owned)
            .collect();
        let stats = parse_perf_stat(&out).unwrap();
        assert_eq!(stats.loads, 8_000_000);
        assert_eq!(stats.store_misses, 1_000_000);
        assert!((stats.miss_ratio() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn unsupported_events() {
        let out: Vec<String> = vec![
            "   <not supported>      LLC-loads".to_owned(),
            "   <not supported>      LLC-stores".to_owned(),
        ];
        assert!(parse_perf_stat(&out).is_err());
    }
}
