use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use sshx_proto::{Status, app};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{Adapter, AdapterBase, AdapterContext, AdapterError, AdapterFactory};

/// Status queries are answered by the multiplexer itself; the adapter only
/// exists so that the STAT code resolves and for rendering on the CLI side.
pub struct StatAdapter {
    base: AdapterBase,
}

pub fn factory() -> AdapterFactory {
    Arc::new(|_payload: &[u8], _ctx: &AdapterContext| {
        Ok(Arc::new(StatAdapter {
            base: AdapterBase::new(String::new(), None),
        }) as Arc<dyn Adapter>)
    })
}

#[async_trait]
impl Adapter for StatAdapter {
    fn code(&self) -> i32 {
        app::STAT
    }

    fn base(&self) -> &AdapterBase {
        &self.base
    }

    async fn dial(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("stat"))
    }

    async fn respond(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("stat"))
    }
}

fn started(ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

pub fn render_table(stats: &[Status]) -> String {
    let width = stats
        .iter()
        .map(|status| status.pair_id.len())
        .max()
        .unwrap_or(0)
        .max("PAIR".len());
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:<8}  {:<36}  {:<width$}  STARTED",
        "PAIR", "APP", "TARGET", "PARENT"
    );
    for status in stats {
        let _ = writeln!(
            out,
            "{:<width$}  {:<8}  {:<36}  {:<width$}  {}",
            status.pair_id,
            app::name(status.app_code),
            status.target_id,
            status.parent_pair_id.as_deref().unwrap_or("-"),
            started(status.start_time),
        );
    }
    out
}

/// Parents first, children indented underneath. Orphans whose parent is no
/// longer tracked are shown at the top level, as is every entry of a parent
/// loop that no root reaches.
pub fn render_tree(stats: &[Status]) -> String {
    let known: BTreeMap<&str, &Status> = stats.iter().map(|s| (s.pair_id.as_str(), s)).collect();
    let mut children: BTreeMap<&str, Vec<&Status>> = BTreeMap::new();
    let mut roots = Vec::new();
    for status in stats {
        match status.parent_pair_id.as_deref() {
            Some(parent) if parent != status.pair_id && known.contains_key(parent) => {
                children.entry(parent).or_default().push(status)
            }
            _ => roots.push(status),
        }
    }

    let mut out = String::new();
    let mut visited = HashSet::new();
    for root in roots {
        write_node(&mut out, root, &children, &mut visited, 0);
    }
    for status in stats {
        if !visited.contains(status.pair_id.as_str()) {
            write_node(&mut out, status, &children, &mut visited, 0);
        }
    }
    out
}

fn write_node<'a>(
    out: &mut String,
    status: &'a Status,
    children: &BTreeMap<&str, Vec<&'a Status>>,
    visited: &mut HashSet<&'a str>,
    depth: usize,
) {
    if !visited.insert(status.pair_id.as_str()) {
        return;
    }
    let _ = writeln!(
        out,
        "{}{} [{}] -> {}",
        "  ".repeat(depth),
        status.pair_id,
        app::name(status.app_code),
        status.target_id
    );
    if let Some(kids) = children.get(status.pair_id.as_str()) {
        for child in kids {
            write_node(out, *child, children, visited, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, app_code: i32, parent: Option<&str>) -> Status {
        Status {
            pair_id: id.into(),
            target_id: "host-b".into(),
            app_code,
            parent_pair_id: parent.map(Into::into),
            start_time: 0,
        }
    }

    #[test]
    fn tree_nests_children_under_their_parent() {
        let stats = vec![
            status("conn_4_1_1", app::PROXY, None),
            status("conn_0_2_1", app::SSH, Some("conn_4_1_1")),
            status("conn_0_3_1", app::SSH, Some("conn_gone")),
        ];
        let tree = render_tree(&stats);
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines[0], "conn_4_1_1 [proxy] -> host-b");
        assert_eq!(lines[1], "  conn_0_2_1 [ssh] -> host-b");
        assert_eq!(lines[2], "conn_0_3_1 [ssh] -> host-b");
    }

    #[test]
    fn tree_survives_parent_loops() {
        let stats = vec![
            status("conn_0_5_1", app::SSH, Some("conn_0_5_1")),
            status("conn_0_6_1", app::SSH, Some("conn_0_7_1")),
            status("conn_0_7_1", app::SSH, Some("conn_0_6_1")),
        ];
        let tree = render_tree(&stats);
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(
            lines,
            vec![
                "conn_0_5_1 [ssh] -> host-b",
                "conn_0_6_1 [ssh] -> host-b",
                "  conn_0_7_1 [ssh] -> host-b",
            ]
        );
    }

    #[test]
    fn table_has_one_row_per_status() {
        let stats = vec![status("conn_0_2_1", app::SSH, None)];
        let table = render_table(&stats);
        assert_eq!(table.lines().count(), 2);
        assert!(table.contains("1970-01-01T00:00:00Z"));
    }
}
