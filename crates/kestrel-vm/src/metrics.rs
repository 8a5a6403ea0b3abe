use std::fmt::Write as _;
use std::time::Duration;

use kestrel_code::Op;
use rustc_hash::FxHashMap;

/// Execution measurements for one engine, owned by the caller and passed in
/// per invocation. Collection is best-effort profiling support; the engine
/// runs without one at no cost.
#[derive(Debug, Default)]
pub struct ExecProfile {
    op_counts: FxHashMap<Op, (u64, Duration)>,
    inst_counts: Vec<(u64, Duration)>,
    /// Total CPU time across profiled invocations.
    pub cpu_time: Duration,
}

impl ExecProfile {
    pub fn new() -> ExecProfile {
        ExecProfile::default()
    }

    pub(crate) fn ensure_len(&mut self, n: usize) {
        if self.inst_counts.len() < n {
            self.inst_counts.resize(n, (0, Duration::ZERO));
        }
    }

    pub(crate) fn record(&mut self, op: Op, pc: usize, dt: Duration) {
        let entry = self.op_counts.entry(op).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += dt;
        if let Some(slot) = self.inst_counts.get_mut(pc) {
            slot.0 += 1;
            slot.1 += dt;
        }
    }

    pub fn op_count(&self, op: Op) -> u64 {
        self.op_counts.get(&op).map_or(0, |(n, _)| *n)
    }

    pub fn executed_instructions(&self) -> u64 {
        self.op_counts.values().map(|(n, _)| *n).sum()
    }

    /// Per-opcode counts and CPU times, then per-instruction totals.
    pub fn report(&self) -> String {
        let mut out = String::new();

        let mut ops: Vec<(Op, (u64, Duration))> = self
            .op_counts
            .iter()
            .map(|(op, stats)| (*op, *stats))
            .collect();
        ops.sort_by_key(|(op, _)| op.name());

        for (op, (count, cpu)) in ops {
            let _ = writeln!(out, "{}\t{}\t{:.06}", op.name(), count, cpu.as_secs_f64());
        }

        let _ = writeln!(out, "CPU time: {:.06}", self.cpu_time.as_secs_f64());

        for (pc, (count, cpu)) in self.inst_counts.iter().enumerate() {
            if *count > 0 {
                let _ = writeln!(out, "{pc} {count} {:.06}", cpu.as_secs_f64());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let mut p = ExecProfile::new();
        p.ensure_len(4);
        p.record(Op::AddCountVVC, 0, Duration::ZERO);
        p.record(Op::AddCountVVC, 0, Duration::ZERO);
        p.record(Op::ReturnV, 3, Duration::ZERO);
        assert_eq!(p.op_count(Op::AddCountVVC), 2);
        assert_eq!(p.executed_instructions(), 3);
        assert!(p.report().contains("add_count_vvc\t2"));
    }
}
