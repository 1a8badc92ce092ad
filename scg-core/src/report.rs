//! Aggregates trace chains into a per-function call-graph and renders the
//! profiler's text report (spec §4.7, §6).
//!
//! Record keying follows `original_source/output.cc::address_to_record`
//! rather than a literal reading of "the record key is address − offset":
//! the original discards the *module* name entirely when no symbol is
//! found and instead canonicalizes by the raw address with offset forced
//! to zero. Taking the Resolver's offset literally in that case (which is
//! `address` itself, per spec §8.6/E6) would collapse every unresolved
//! address into a single record. We follow the original here; see
//! DESIGN.md.

use std::collections::HashMap;
use std::io::Write;

use crate::arena::NodeId;
use crate::domain::SPONTANEOUS;
use crate::errors::ReportError;
use crate::resolver::Resolved;
use crate::trace_index;

/// Writes `text` to `path`, wrapping the failure mode both preloads share
/// (spec §7 "Report output failure") in one place so `scg-profiler` and
/// `scg-mtrace` don't each re-derive it.
pub fn write_to_path(path: &str, text: &str) -> Result<(), ReportError> {
    let mut file = std::fs::File::create(path).map_err(|source| ReportError::Destination {
        path: path.to_string(),
        source,
    })?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RecordKey {
    Spontaneous,
    Address(usize),
}

#[derive(Debug, Default)]
pub struct FunctionRecord {
    pub name: String,
    caller_counts: HashMap<RecordKey, u64>,
    callee_counts: HashMap<RecordKey, u64>,
    pub call_count: u64,
    pub terminal_count: u64,
    /// Index `i` holds the sample count for chains where this function
    /// occurred `i + 1` times (recursion depth breakdown).
    pub call_count_breakdown: Vec<u64>,
}

impl FunctionRecord {
    fn new(name: String) -> Self {
        FunctionRecord { name, ..Default::default() }
    }
}

/// A built profile, ready to render. Not signal-safe to construct — it
/// walks every sampled trace chain and performs symbol resolution.
pub struct Database {
    records: HashMap<RecordKey, FunctionRecord>,
    total_samples: u64,
}

fn canonical_key_and_name(address: usize, resolved: &Resolved) -> (RecordKey, String) {
    match &resolved.symbol_name {
        Some(name) => (RecordKey::Address(address.wrapping_sub(resolved.offset)), name.clone()),
        None => (RecordKey::Address(address), format!("{address:#x}")),
    }
}

impl Database {
    /// Scans every Trace Node with a nonzero counter, resolving each
    /// address through `resolve` (normally [`crate::resolver::resolve`]
    /// bound to a fresh [`crate::module_registry::ModuleRegistry`]
    /// snapshot).
    pub fn build(resolve: impl Fn(usize) -> Resolved) -> Database {
        let mut db = Database { records: HashMap::new(), total_samples: 0 };
        db.records
            .insert(RecordKey::Spontaneous, FunctionRecord::new(SPONTANEOUS.to_string()));

        trace_index::for_each_terminal_node(|node| {
            let counter = node.counter();
            if counter == 0 {
                return;
            }
            db.total_samples += counter;
            db.process_chain(node, counter, &resolve);
        });

        db
    }

    fn process_chain(&mut self, leaf: NodeId, counter: u64, resolve: &impl Fn(usize) -> Resolved) {
        // Collect leaf..root, then walk root..leaf so the synthetic
        // `<spontaneous>` caller is assigned to the outermost frame.
        let mut chain = Vec::new();
        let mut cursor = Some(leaf);
        while let Some(node) = cursor {
            chain.push(node.address().0);
            cursor = node.parent();
        }
        chain.reverse();

        let mut occur_counts: HashMap<RecordKey, u64> = HashMap::new();
        let mut caller_key = RecordKey::Spontaneous;
        let mut last_key = RecordKey::Spontaneous;

        for address in chain {
            let resolved = resolve(address);
            let (key, name) = canonical_key_and_name(address, &resolved);

            self.records.entry(key).or_insert_with(|| FunctionRecord::new(name));
            *self.records.get_mut(&key).unwrap().caller_counts.entry(caller_key).or_insert(0) +=
                counter;
            *self
                .records
                .get_mut(&caller_key)
                .expect("caller record was inserted in a prior iteration, or is <spontaneous>")
                .callee_counts
                .entry(key)
                .or_insert(0) += counter;

            *occur_counts.entry(key).or_insert(0) += 1;
            caller_key = key;
            last_key = key;
        }

        if let Some(record) = self.records.get_mut(&last_key) {
            record.terminal_count += counter;
        }

        for (key, occurrences) in occur_counts {
            let record = self.records.get_mut(&key).unwrap();
            record.call_count += counter;
            let depth = occurrences as usize;
            if record.call_count_breakdown.len() < depth {
                record.call_count_breakdown.resize(depth, 0);
            }
            record.call_count_breakdown[depth - 1] += counter;
        }
    }

    /// Renders the text report described in spec §6.
    pub fn render(&self, program_name: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Profile for {program_name} with {} samples.\n",
            self.total_samples
        ));

        let mut entries: Vec<&FunctionRecord> = self
            .records
            .iter()
            .filter(|(key, _)| **key != RecordKey::Spontaneous)
            .map(|(_, record)| record)
            .collect();
        entries.sort_by(|a, b| b.call_count.cmp(&a.call_count));

        for record in entries {
            out.push_str(&"-".repeat(79));
            out.push('\n');

            let mut callers: Vec<(&RecordKey, &u64)> = record.caller_counts.iter().collect();
            callers.sort_by_key(|(_, count)| **count);
            for (key, count) in callers {
                out.push_str(&format!("\t{count}\t{}\n", self.display_name(key)));
            }

            out.push_str(&self.header_line(record));

            let mut callees: Vec<(&RecordKey, &u64)> = record.callee_counts.iter().collect();
            callees.sort_by(|(_, a), (_, b)| b.cmp(a));
            for (key, count) in callees {
                out.push_str(&format!("\t{count}\t{}\n", self.display_name(key)));
            }
        }

        out
    }

    fn display_name(&self, key: &RecordKey) -> &str {
        self.records.get(key).map(|r| r.name.as_str()).unwrap_or("?")
    }

    fn header_line(&self, record: &FunctionRecord) -> String {
        let total = self.total_samples.max(1) as f64;
        let term_pct = record.terminal_count as f64 * 100.0 / total;
        let call_pct = record.call_count as f64 * 100.0 / total;

        if record.call_count_breakdown.len() <= 1 {
            format!(
                "+{}\t{}/{} ({term_pct:.2}%/{call_pct:.2}%)\n",
                record.name, record.terminal_count, record.call_count
            )
        } else {
            let mut line = format!(
                "+{}\t{}/{} (",
                record.name, record.terminal_count, record.call_count
            );
            for count in &record.call_count_breakdown {
                line.push_str(&format!(" {count}"));
            }
            line.push_str(&format!(" ) ({term_pct:.2}%/{call_pct:.2}%)\n"));
            line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;
    use crate::trace_index::intern;

    fn resolve_by_name(names: &HashMap<usize, &str>) -> impl Fn(usize) -> Resolved + '_ {
        move |address| Resolved {
            module_name: Some("demo".to_string()),
            symbol_name: names.get(&address).map(|n| n.to_string()),
            offset: 0,
        }
    }

    #[test]
    fn main_f_g_chain_assigns_terminal_and_call_counts() {
        trace_index::ensure_initialized();
        let main_addr = 0x1_0000_1000usize;
        let f_addr = 0x1_0000_2000usize;
        let g_addr = 0x1_0000_3000usize;

        let main_node = intern(None, Address(main_addr)).unwrap();
        let f_node = intern(Some(main_node), Address(f_addr)).unwrap();
        let g_node = intern(Some(f_node), Address(g_addr)).unwrap();
        for _ in 0..100 {
            g_node.increment_counter();
        }

        let mut names = HashMap::new();
        names.insert(main_addr, "main");
        names.insert(f_addr, "f");
        names.insert(g_addr, "g");

        let db = Database::build(resolve_by_name(&names));
        let g = db.records.get(&RecordKey::Address(g_addr)).unwrap();
        assert_eq!(g.terminal_count, 100);

        let f = db.records.get(&RecordKey::Address(f_addr)).unwrap();
        assert_eq!(f.call_count, 100);

        let main = db.records.get(&RecordKey::Address(main_addr)).unwrap();
        assert_eq!(main.call_count, 100);
        assert_eq!(*main.caller_counts.get(&RecordKey::Spontaneous).unwrap(), 100);
    }

    #[test]
    fn header_line_prefixes_a_flat_record_with_plus() {
        let db = Database { records: HashMap::new(), total_samples: 100 };
        let mut record = FunctionRecord::new("g".to_string());
        record.terminal_count = 100;
        record.call_count = 100;
        assert_eq!(db.header_line(&record), "+g\t100/100 (100.00%/100.00%)\n");
    }

    #[test]
    fn header_line_includes_recursion_breakdown() {
        let db = Database { records: HashMap::new(), total_samples: 10 };
        let mut record = FunctionRecord::new("r".to_string());
        record.terminal_count = 10;
        record.call_count = 10;
        record.call_count_breakdown = vec![0, 0, 0, 10];
        assert_eq!(db.header_line(&record), "+r\t10/10 ( 0 0 0 10 ) (100.00%/100.00%)\n");
    }

    #[test]
    fn write_to_path_round_trips_through_a_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        write_to_path(path.to_str().unwrap(), "hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn write_to_path_reports_an_unopenable_destination() {
        let err = write_to_path("/nonexistent-dir-for-scg-tests/report.txt", "x").unwrap_err();
        assert!(matches!(err, ReportError::Destination { .. }));
    }
}
