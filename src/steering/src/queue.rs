//! CPU/NUMA to RX queue lookup for the default IRQ affinity layout of the
//! 24-core testbed NIC.
use thiserror::Error;

/// RX queue whose interrupt is bound to each CPU 0-23.
pub const CPU_TO_RX_QUEUE: [usize; 24] = [
    0, 6, 7, 8, 1, 9, 10, 11, 2, 12, 13, 14, 3, 15, 16, 17, 4, 18, 19, 20, 5, 21, 22, 23,
];

/// One RX queue whose DMA lands on each NUMA node 0-3.
pub const NUMA_TO_RX_QUEUE: [usize; 4] = [0, 6, 7, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{what} {index} out of range [0, {len})")]
pub struct OutOfRange {
    pub what: &'static str,
    pub index: usize,
    pub len: usize,
}

fn lookup(table: &[usize], what: &'static str, index: usize) -> Result<usize, OutOfRange> {
    table.get(index).copied().ok_or(OutOfRange {
        what,
        index,
        len: table.len(),
    })
}

#[inline]
pub fn queue_for(cpu: usize) -> Result<usize, OutOfRange> {
    lookup(&CPU_TO_RX_QUEUE, "cpu", cpu)
}

#[inline]
pub fn dma_queue_for(numa_node: usize) -> Result<usize, OutOfRange> {
    lookup(&NUMA_TO_RX_QUEUE, "numa node", numa_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_a_permutation() {
        let mut queues = CPU_TO_RX_QUEUE.to_vec();
        queues.sort_unstable();
        assert_eq!(queues, (0..24).collect::<Vec<_>>());
    }

    #[test]
    fn lookups() {
        assert_eq!(queue_for(0), Ok(0));
        assert_eq!(queue_for(1), Ok(6));
        assert_eq!(queue_for(23), Ok(23));
        assert_eq!(dma_queue_for(3), Ok(8));
    }

    #[test]
    fn out_of_range() {
        assert_eq!(
            queue_for(24),
            Err(OutOfRange {
                what: "cpu",
                index: 24,
                len: 24
            })
        );
        let err = dma_queue_for(4).unwrap_err();
        assert_eq!(err.to_string(), "numa node 4 out of range [0, 4)");
    }
}
