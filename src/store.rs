//! Job-scoped variables, instance results and signals.
//!
//! The store is owned by the job coordinator. Writes arrive in completion
//! order, so "last writer wins" means the last report the coordinator
//! processed.

use crate::execution::instance::InstanceId;
use crate::flog_trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Results committed by one task instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Instance label, e.g. `process*2`.
    pub label: String,
    /// Main result value.
    pub value: Value,
    /// Keyed entries written into the job result map.
    pub entries: BTreeMap<String, Value>,
    pub precious: bool,
    /// Lines printed by the task.
    pub output: Vec<String>,
}

#[derive(Debug, Default)]
pub struct VariableStore {
    job_variables: BTreeMap<String, String>,
    results: HashMap<InstanceId, ResultRecord>,
    /// Commit order of precious records.
    precious: Vec<InstanceId>,
    signals: BTreeSet<String>,
    awaited_signals: BTreeSet<String>,
}

impl VariableStore {
    pub fn new(job_variables: BTreeMap<String, String>) -> Self {
        Self {
            job_variables,
            ..Self::default()
        }
    }

    pub fn put_job_variable(&mut self, key: &str, value: &str) {
        flog_trace!("job variable {}={}", key, value);
        self.job_variables.insert(key.to_string(), value.to_string());
    }

    pub fn get_job_variable(&self, key: &str) -> Option<&str> {
        self.job_variables.get(key).map(String::as_str)
    }

    pub fn job_variables(&self) -> &BTreeMap<String, String> {
        &self.job_variables
    }

    /// Commit the main result of a finished instance.
    pub fn set_result(&mut self, instance: InstanceId, label: &str, value: Value, precious: bool) {
        let record = self.results.entry(instance).or_default();
        record.label = label.to_string();
        record.value = value;
        if precious && !record.precious {
            record.precious = true;
            self.precious.push(instance);
        }
    }

    /// Associate a keyed value with an instance.
    pub fn put_result(&mut self, instance: InstanceId, key: &str, value: Value) {
        self.results
            .entry(instance)
            .or_default()
            .entries
            .insert(key.to_string(), value);
    }

    pub fn append_output(&mut self, instance: InstanceId, lines: Vec<String>) {
        self.results.entry(instance).or_default().output.extend(lines);
    }

    pub fn result(&self, instance: &InstanceId) -> Option<&ResultRecord> {
        self.results.get(instance)
    }

    /// Main results of `instances`, in the given order. Instances without a
    /// committed result (failed or skipped) hold their position with null.
    pub fn results_of(&self, instances: &[InstanceId]) -> Vec<Value> {
        instances
            .iter()
            .map(|id| {
                self.results
                    .get(id)
                    .map(|r| r.value.clone())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Keyed results of `instances`, later instances overriding earlier ones.
    pub fn entries_of(&self, instances: &[InstanceId]) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for id in instances {
            if let Some(record) = self.results.get(id) {
                merged.extend(record.entries.clone());
            }
        }
        merged
    }

    /// Drop an instance's results unless they are precious. Printed output
    /// is kept for the job output.
    pub fn release(&mut self, instance: &InstanceId) -> bool {
        let Some(record) = self.results.get_mut(instance) else {
            return false;
        };
        if record.precious {
            return false;
        }
        if record.output.is_empty() {
            self.results.remove(instance);
        } else {
            record.value = Value::Null;
            record.entries.clear();
        }
        true
    }

    /// Keyed entries of precious instances, in commit order.
    pub fn job_result_map(&self) -> BTreeMap<String, Value> {
        self.entries_of(&self.precious)
    }

    /// Main results of precious instances by label.
    pub fn precious_results(&self) -> BTreeMap<String, Value> {
        self.precious
            .iter()
            .filter_map(|id| self.results.get(id))
            .map(|r| (r.label.clone(), r.value.clone()))
            .collect()
    }

    /// Printed output of every instance that still has a record.
    pub fn output(&self) -> BTreeMap<String, Vec<String>> {
        self.results
            .values()
            .filter(|r| !r.output.is_empty())
            .map(|r| (r.label.clone(), r.output.clone()))
            .collect()
    }

    pub fn retained_count(&self) -> usize {
        self.results.len()
    }

    /// Mark a signal as awaited by some task.
    pub fn ready_for_signal(&mut self, signal: &str) {
        self.awaited_signals.insert(signal.to_string());
    }

    /// Signals declared ready for and not sent yet.
    pub fn awaited_signals(&self) -> &BTreeSet<String> {
        &self.awaited_signals
    }

    pub fn send_signal(&mut self, signal: &str) {
        flog_trace!("signal {}", signal);
        self.awaited_signals.remove(signal);
        self.signals.insert(signal.to_string());
    }

    pub fn remove_signal(&mut self, signal: &str) -> bool {
        self.signals.remove(signal)
    }

    pub fn signals(&self) -> &BTreeSet<String> {
        &self.signals
    }
}
