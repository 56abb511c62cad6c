//! Exit-time counters (expansion, grounded in blink's `STATISTIC()` macro
//! usage throughout `jit.c`/`path.c`). Printed when `-s`/`--statistics` is
//! passed on the CLI; otherwise pure overhead-free bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub jit_blocks: AtomicU64,
    pub path_count: AtomicU64,
    pub path_ooms: AtomicU64,
    pub path_abandoned: AtomicU64,
    pub path_longest_bytes: AtomicU64,
    pub path_longest_elements: AtomicU64,
    pub jumps_recorded: AtomicU64,
    pub jumps_applied: AtomicU64,
    pub instructions_executed: AtomicU64,
    pub instructions_jitted: AtomicU64,
}

impl Stats {
    pub fn report(&self) -> String {
        macro_rules! line {
            ($field:ident) => {
                format!("{:<24} {}\n", stringify!($field), self.$field.load(Ordering::Relaxed))
            };
        }
        let mut s = String::new();
        s.push_str(&line!(jit_blocks));
        s.push_str(&line!(path_count));
        s.push_str(&line!(path_ooms));
        s.push_str(&line!(path_abandoned));
        s.push_str(&line!(path_longest_bytes));
        s.push_str(&line!(path_longest_elements));
        s.push_str(&line!(jumps_recorded));
        s.push_str(&line!(jumps_applied));
        s.push_str(&line!(instructions_executed));
        s.push_str(&line!(instructions_jitted));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_includes_every_counter() {
        let stats = Stats::default();
        stats.instructions_executed.fetch_add(5, Ordering::Relaxed);
        let report = stats.report();
        assert!(report.contains("instructions_executed"));
        assert!(report.contains('5'));
    }
}
