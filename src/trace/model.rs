//! Session trace records.
//!
//! Durations are nanoseconds. Field names follow the record layout readers
//! of trace files already expect (`executionStart`, `LWLockPlanning`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// One line of a structured trace file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub pid: u32,
    pub queries: Vec<QueryTrace>,
    /// More records of the same session follow.
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsing_time: Option<u64>,
    #[serde(rename = "LWLockParsing", default, skip_serializing_if = "Option::is_none")]
    pub lwlock_parsing: Option<Vec<LWLockStat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_time: Option<u64>,
    #[serde(rename = "LWLockPlanning", default, skip_serializing_if = "Option::is_none")]
    pub lwlock_planning: Option<Vec<LWLockStat>>,
    /// Wall clock time, `YYYY:MM:DDTHH:MM:SS.mmm`.
    pub execution_start: String,
    pub explain: Explain,
    pub execution_events: Vec<ExecutionEvent>,
    /// Execution events counted but not kept once the query's event list
    /// reached its size cap.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub events_dropped: u64,
    pub execution_time: u64,
    /// Explain plan with `traceData` attached to every executed node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_node_stat_in_plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr_node_stat: Option<Vec<ExprNodeStat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks_inside_portal_run: Option<Vec<LWLockStat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks_outside_portal_run: Option<Vec<LWLockStat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_event_stat: Option<Vec<WaitEventStat>>,
    /// Closed by an abort before the executor finished.
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
}

impl QueryTrace {
    /// Nested queries run from inside this one.
    pub fn nested(&self) -> impl Iterator<Item = &QueryTrace> {
        self.execution_events.iter().filter_map(|e| match e {
            ExecutionEvent::Query(q) => Some(q.as_ref()),
            ExecutionEvent::Node(_) => None,
        })
    }

    /// Levels of query nesting, 1 for a query without nested queries.
    pub fn depth(&self) -> usize {
        1 + self.nested().map(QueryTrace::depth).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explain {
    #[serde(rename = "Query Text")]
    pub query_text: String,
    #[serde(rename = "Plan")]
    pub plan: Value,
}

/// Entry of `executionEvents`: an executor node run or a nested query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionEvent {
    Node(NodeEvent),
    Query(Box<QueryTrace>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<Value>,
    pub execute_time: u64,
    #[serde(rename = "LWLockStat", default, skip_serializing_if = "Option::is_none")]
    pub lwlock_stat: Option<Vec<LWLockStat>>,
}

/// Totals for one plan node, attached as `traceData`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTraceData {
    pub total_calls: u64,
    pub total_time_sum: u64,
    pub max_time: u64,
}

impl NodeTraceData {
    pub fn record(&mut self, ns: u64) {
        self.total_calls += 1;
        self.total_time_sum += ns;
        self.max_time = self.max_time.max(ns);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExprNodeStat {
    pub node: String,
    #[serde(flatten)]
    pub trace_data: NodeTraceData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferTagInfo {
    pub spc_oid: u32,
    pub spc_name: Option<String>,
    pub db_oid: u32,
    pub db_name: Option<String>,
    pub rel_number: u32,
    /// `namespace.relation`
    pub rel_name: Option<String>,
    pub rel_kind: Option<String>,
    pub fork_name: String,
    pub block_number: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockModeStat {
    pub total_calls: u64,
    pub sleep_count: u64,
    pub sleep_time_sum: u64,
    pub max_sleep_time: u64,
}

impl LockModeStat {
    pub fn record(&mut self, sleep_ns: u64) {
        self.total_calls += 1;
        if sleep_ns > 0 {
            self.sleep_count += 1;
            self.sleep_time_sum += sleep_ns;
            self.max_sleep_time = self.max_sleep_time.max(sleep_ns);
        }
    }

    pub fn merge(&mut self, other: &LockModeStat) {
        self.total_calls += other.total_calls;
        self.sleep_count += other.sleep_count;
        self.sleep_time_sum += other.sleep_time_sum;
        self.max_sleep_time = self.max_sleep_time.max(other.max_sleep_time);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LWLockStat {
    pub buffer_tag: BufferTagInfo,
    pub exclusive: LockModeStat,
    pub shared: LockModeStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitEventStat {
    pub name: String,
    pub count: u64,
    pub time_sum: u64,
    pub max_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(text: &str, events: Vec<ExecutionEvent>) -> QueryTrace {
        QueryTrace {
            parsing_time: None,
            lwlock_parsing: None,
            planning_time: Some(10),
            lwlock_planning: None,
            execution_start: "2024:01:02T03:04:05.006".into(),
            explain: Explain {
                query_text: text.into(),
                plan: json!({"Node Type": "Result"}),
            },
            execution_events: events,
            events_dropped: 0,
            execution_time: 100,
            executor_node_stat_in_plan: None,
            expr_node_stat: None,
            locks_inside_portal_run: None,
            locks_outside_portal_run: None,
            wait_event_stat: None,
            truncated: false,
        }
    }

    #[test]
    fn test_query_field_names() {
        let v = serde_json::to_value(query("select 1", vec![])).unwrap();
        assert_eq!(v["executionStart"], "2024:01:02T03:04:05.006");
        assert_eq!(v["explain"]["Query Text"], "select 1");
        assert!(v["explain"]["Plan"].is_object());
        assert_eq!(v["planningTime"], 10);
        assert!(v.get("parsingTime").is_none());
        assert!(v.get("truncated").is_none());
        assert!(v["executionEvents"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_nested_events_parse_back() {
        let node = ExecutionEvent::Node(NodeEvent {
            node: "SeqScan".into(),
            explain: Some(json!({"Node Type": "Seq Scan"})),
            execute_time: 5,
            lwlock_stat: None,
        });
        let inner = query("select 2", vec![node.clone()]);
        let outer = query("select f()", vec![node, ExecutionEvent::Query(Box::new(inner))]);
        let record = SessionRecord {
            pid: 42,
            queries: vec![outer],
            partial: false,
        };

        let line = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.queries[0].depth(), 2);
        assert_eq!(back.queries[0].nested().count(), 1);
    }

    #[test]
    fn test_lock_mode_sleep_invariant() {
        let mut s = LockModeStat::default();
        s.record(0);
        assert_eq!((s.sleep_count, s.sleep_time_sum, s.max_sleep_time), (0, 0, 0));
        s.record(30);
        s.record(10);
        assert_eq!(s.total_calls, 3);
        assert_eq!((s.sleep_count, s.sleep_time_sum, s.max_sleep_time), (2, 40, 30));
    }

    #[test]
    fn test_expr_stat_is_flat() {
        let mut data = NodeTraceData::default();
        data.record(7);
        let v = serde_json::to_value(ExprNodeStat {
            node: "FuncExpr".into(),
            trace_data: data,
        })
        .unwrap();
        assert_eq!(
            v,
            json!({"node": "FuncExpr", "totalCalls": 1, "totalTimeSum": 7, "maxTime": 7})
        );
    }
}
