//! `sar -u -P <cpus> 1 N` per-core utilisation.
use super::{parse_number, ParseError};
use std::collections::BTreeMap;

/// Column positions counted from the end of a header, so the timestamp
/// format (`12:00:01 PM`, `12:00:01`, `Average:`) does not matter.
#[derive(Debug, Clone, Copy)]
struct Columns {
    width: usize,
    cpu_from_end: usize,
    idle_from_end: usize,
}

impl Columns {
    fn from_header(tokens: &[&str]) -> Option<Columns> {
        let cpu = tokens.iter().position(|&t| t == "CPU")?;
        let idle = tokens.iter().position(|&t| t == "%idle")?;
        Some(Columns {
            width: tokens.len(),
            cpu_from_end: tokens.len() - cpu,
            idle_from_end: tokens.len() - idle,
        })
    }

    fn row(&self, tokens: &[&str]) -> Option<(usize, f64)> {
        if tokens.len() != self.width {
            return None;
        }
        // the `all` row is skipped
        let cpu = tokens[self.width - self.cpu_from_end].parse().ok()?;
        let idle = parse_number(tokens[self.width - self.idle_from_end])?;
        Some((cpu, 100.0 - idle))
    }
}

/// Per-core utilisation (`100 - %idle`). `Average:` rows are preferred; if the
/// run was cut before sar printed them, periodic rows are averaged.
pub fn parse_sar(lines: &[String]) -> Result<BTreeMap<usize, f64>, ParseError> {
    let mut columns = None;
    let mut averages = BTreeMap::new();
    let mut periodic: BTreeMap<usize, Vec<f64>> = BTreeMap::new();

    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if let Some(c) = Columns::from_header(&tokens) {
            columns = Some(c);
            continue;
        }
        let (cpu, util) = match columns.and_then(|c| c.row(&tokens)) {
            Some(row) => row,
            None => continue,
        };
        if tokens[0] == "Average:" {
            averages.insert(cpu, util);
        } else {
            periodic.entry(cpu).or_default().push(util);
        }
    }

    if !averages.is_empty() {
        return Ok(averages);
    }
    if periodic.is_empty() {
        return Err(ParseError::missing("sar utilisation row", lines));
    }
    Ok(periodic
        .into_iter()
        .map(|(cpu, samples)| {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            (cpu, mean)
        })
        .collect())
}

pub fn total_utilisation(per_core: &BTreeMap<usize, f64>) -> f64 {
    per_core.values().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    const HEADER: &str = "Linux 5.4.0-77-generic (hostA) \t10/17/2026 \t_x86_64_\t(24 CPU)";

    #[test]
    fn average_rows_win() {
        let out = lines(&format!(
            "{}

12:00:01 PM     CPU     %user     %nice   %system   %iowait    %steal     %idle
12:00:02 PM       0      1.00      0.00      3.00      0.00      0.00     96.00
12:00:02 PM       1      2.00      0.00     18.00      0.00      0.00     80.00

Average:        CPU     %user     %nice   %system   %iowait    %steal     %idle
Average:          0      1.50      0.00      3.50      0.00      0.00     95.00
Average:          1      2.50      0.00     17.50      0.00      0.00     80.00",
            HEADER
        ));
        let per_core = parse_sar(&out).unwrap();
        assert_eq!(per_core.len(), 2);
        assert!((per_core[&0] - 5.0).abs() < 1e-9);
        assert!((total_utilisation(&per_core) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn interrupted_run_averages_periodic_rows() {
        let out = lines(
            "12:00:01     CPU     %user     %nice   %system   %iowait    %steal     %idle
12:00:02       all      4.00      0.00      4.00      0.00      0.00     92.00
12:00:02       4      10.00      0.00     10.00      0.00      0.00     80.00
12:00:03       4      20.00      0.00     20.00      0.00      0.00     60.00",
        );
        let per_core = parse_sar(&out).unwrap();
        assert_eq!(per_core.keys().copied().collect::<Vec<_>>(), vec![4]);
        assert!((per_core[&4] - 30.0).abs() < 1e-9);
    }

    #[test]
    fn no_rows() {
        assert!(parse_sar(&lines(HEADER)).is_err());
        assert!(parse_sar(&[]).is_err());
    }
}
