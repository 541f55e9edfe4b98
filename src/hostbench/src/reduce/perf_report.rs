//! Symbol attribution of a `perf report --stdio` profile.
//!
//! Each top-level entry is attributed to a category through a [`SymbolMap`].
//! Entries below the resolution threshold are left out, so whatever does not
//! add up to 100% is reported as unaccounted.
use super::{parse_number, ParseError};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category of entries whose symbol is not in the map.
pub const UNKNOWN: &str = "unknown";

/// Unaccounted share above which the unresolved symbols must be shown.
pub const ATTENTION_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Category {
    pub name: String,
    /// Exact symbol names
    pub symbols: Vec<String>,
    /// Symbol name prefixes; the longest matching prefix wins
    pub prefixes: Vec<String>,
}

impl Category {
    fn new(name: &str, symbols: &[&str], prefixes: &[&str]) -> Self {
        Category {
            name: name.to_owned(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SymbolMap {
    pub categories: Vec<Category>,
}

lazy_static! {
    static ref KERNEL_SYMBOLS: SymbolMap = SymbolMap {
        categories: vec![
            Category::new(
                "data copy",
                &[
                    "copy_user_enhanced_fast_string",
                    "copy_user_generic_string",
                    "copy_user_generic_unrolled",
                    "skb_copy_datagram_iter",
                    "simple_copy_to_iter",
                ],
                &["memcpy", "__memcpy", "_copy_to_iter", "_copy_from_iter", "copyin", "copyout", "csum_partial_copy"],
            ),
            Category::new(
                "tcp/ip",
                &["release_sock", "lock_sock_nested", "__release_sock"],
                &["tcp_", "__tcp_", "ip_", "__ip_", "ipv4_", "inet_", "sk_", "__sk_", "sock_", "__sock_"],
            ),
            Category::new(
                "netdev",
                &["net_rx_action", "validate_xmit_skb"],
                &["mlx5", "napi_", "__napi_", "netif_", "__netif_", "dev_", "__dev_", "gro_", "dev_gro_", "eth_"],
            ),
            Category::new(
                "skb mgmt",
                &["build_skb", "consume_skb", "kfree_skb", "__kfree_skb", "skb_release_data"],
                &["skb_", "__skb_", "alloc_skb", "__alloc_skb", "napi_alloc_skb", "napi_consume_skb"],
            ),
            Category::new(
                "memory",
                &["kfree", "get_page_from_freelist", "free_unref_page", "__free_pages_ok"],
                &["kmem_cache_", "kmalloc", "__kmalloc", "page_", "__page_", "alloc_pages", "__alloc_pages", "dma_", "iommu_", "free_pcp"],
            ),
            Category::new(
                "lock",
                &[],
                &["_raw_spin_", "native_queued_spin_", "queued_spin_", "mutex_", "__mutex_"],
            ),
            Category::new(
                "scheduling",
                &["schedule", "__schedule", "try_to_wake_up", "finish_task_switch"],
                &["pick_next_", "enqueue_", "dequeue_", "__wake_up", "wake_up_", "select_task_rq"],
            ),
            Category::new(
                "syscall",
                &["syscall_return_via_sysret", "do_syscall_64"],
                &["entry_SYSCALL", "__x64_sys_", "__sys_", "ksys_", "sys_"],
            ),
            Category::new(
                "irq",
                &["common_interrupt", "do_IRQ", "irq_exit"],
                &["__do_softirq", "do_softirq", "__softirqentry", "handle_irq", "handle_edge_irq", "irq_"],
            ),
            Category::new(
                "idle",
                &["do_idle", "cpu_startup_entry", "native_safe_halt"],
                &["intel_idle", "cpuidle_", "poll_idle", "mwait_idle"],
            ),
        ],
    };
}

impl SymbolMap {
    /// Categories for a Linux receive/transmit path profile.
    pub fn kernel_default() -> &'static SymbolMap {
        &KERNEL_SYMBOLS
    }

    pub fn category_of(&self, symbol: &str) -> Option<&str> {
        if let Some(cat) = self
            .categories
            .iter()
            .find(|c| c.symbols.iter().any(|s| s == symbol))
        {
            return Some(cat.name.as_str());
        }
        self.categories
            .iter()
            .flat_map(|c| c.prefixes.iter().map(move |p| (p, c)))
            .filter(|(p, _)| symbol.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, c)| c.name.as_str())
    }
}

/// Category contributions in percent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Breakdown {
    pub contributions: BTreeMap<String, f64>,
    pub unaccounted: f64,
    /// Unmapped symbols, first occurrence order
    pub not_found: Vec<String>,
}

impl Breakdown {
    pub fn total(&self) -> f64 {
        self.contributions.values().sum()
    }

    pub fn needs_attention(&self) -> bool {
        self.unaccounted > ATTENTION_THRESHOLD
    }
}

/// `memcpy_erms.isra.0` and `memcpy_erms` are the same function.
fn normalize(symbol: &str) -> &str {
    symbol.split('.').next().unwrap_or(symbol)
}

#[derive(Debug, Clone, PartialEq)]
struct Entry<'a> {
    percent: f64,
    symbol: &'a str,
}

fn parse_entry(line: &str) -> Option<Entry<'_>> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('|') || trimmed.starts_with('-') {
        return None;
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let first = tokens.first().filter(|t| t.ends_with('%'))?;
    let mut percent = parse_number(first)?;
    // with --children the second column is the self overhead
    if let Some(second) = tokens.get(1).filter(|t| t.ends_with('%')) {
        percent = parse_number(second)?;
    }
    let symbol = match tokens.iter().position(|&t| t == "[k]" || t == "[.]") {
        Some(at) => *tokens.get(at + 1)?,
        None => *tokens.last()?,
    };
    Some(Entry {
        percent,
        symbol: normalize(symbol),
    })
}

pub fn parse_perf_report(lines: &[String], map: &SymbolMap, min_percent: f64) -> Result<Breakdown, ParseError> {
    let entries: Vec<Entry> = lines.iter().filter_map(|l| parse_entry(l)).collect();
    if entries.is_empty() {
        return Err(ParseError::missing("perf report entry", lines));
    }

    let mut breakdown = Breakdown::default();
    for entry in entries.iter().filter(|e| e.percent >= min_percent) {
        let category = match map.category_of(entry.symbol) {
            Some(name) => name,
            None => {
                if !breakdown.not_found.iter().any(|s| s == entry.symbol) {
                    breakdown.not_found.push(entry.symbol.to_owned());
                }
                UNKNOWN
            }
        };
        *breakdown
            .contributions
            .entry(category.to_owned())
            .or_default() += entry.percent;
    }
    breakdown.unaccounted = (100.0 - breakdown.total()).max(0.0);
    Ok(breakdown)
}
