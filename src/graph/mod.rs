//! Link-analysis graph
//! Mission: User-to-user edges, ring structure, and hub detection per organization

pub mod analysis;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::decisions::DecisionStore;
use crate::models::RiskLevel;
use analysis::Subgraph;

/// A canonicalized user-to-user connection (`user_a < user_b`).
#[derive(Debug, Clone, Serialize)]
pub struct UserConnection {
    pub org_id: String,
    pub user_a: String,
    pub user_b: String,
    pub connection_type: String,
    pub connection_value: String,
    pub strength: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_count: u64,
    pub flagged_ring: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeCentrality {
    pub user_id: String,
    pub betweenness: f64,
    pub closeness: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingAnalysis {
    pub user_id: String,
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,
    pub centrality: Vec<NodeCentrality>,
    pub communities: Vec<Vec<String>>,
    pub flagged_edge_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubInfo {
    pub user_id: String,
    pub connection_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub connection_type: String,
    pub strength: f64,
    pub flagged_ring: bool,
}

/// Visualization-ready node/edge lists.
#[derive(Debug, Clone, Serialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS user_connections (
    org_id TEXT NOT NULL,
    user_a TEXT NOT NULL,
    user_b TEXT NOT NULL,
    connection_type TEXT NOT NULL,
    connection_value TEXT NOT NULL,
    strength REAL NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 1,
    flagged_ring INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (org_id, user_a, user_b, connection_type)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_connections_user_a ON user_connections(org_id, user_a);
CREATE INDEX IF NOT EXISTS idx_connections_user_b ON user_connections(org_id, user_b);
"#;

pub struct LinkGraph {
    conn: Arc<Mutex<Connection>>,
}

impl LinkGraph {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open link graph database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize link graph schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert an edge. First co-occurrence creates it; repeats bump
    /// `last_seen` and `event_count` and retain the max strength.
    pub fn record_connection(
        &self,
        org_id: &str,
        user_a: &str,
        user_b: &str,
        connection_type: &str,
        connection_value: &str,
        strength: f64,
    ) -> Result<()> {
        if user_a == user_b {
            return Ok(());
        }
        let (a, b) = canonical_pair(user_a, user_b);
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_connections
                 (org_id, user_a, user_b, connection_type, connection_value, strength,
                  first_seen, last_seen, event_count, flagged_ring)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, 0)
             ON CONFLICT (org_id, user_a, user_b, connection_type) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 event_count = event_count + 1,
                 connection_value = excluded.connection_value,
                 strength = MAX(strength, excluded.strength)",
            params![org_id, a, b, connection_type, connection_value, strength, now],
        )?;

        debug!(org_id, user_a = a, user_b = b, connection_type, "Connection recorded");
        Ok(())
    }

    fn edges_for_org(&self, org_id: &str) -> Result<Vec<UserConnection>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT org_id, user_a, user_b, connection_type, connection_value, strength,
                    first_seen, last_seen, event_count, flagged_ring
             FROM user_connections WHERE org_id = ?1",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            Ok(UserConnection {
                org_id: row.get(0)?,
                user_a: row.get(1)?,
                user_b: row.get(2)?,
                connection_type: row.get(3)?,
                connection_value: row.get(4)?,
                strength: row.get(5)?,
                first_seen: parse_ts(row.get(6)?),
                last_seen: parse_ts(row.get(7)?),
                event_count: row.get(8)?,
                flagged_ring: row.get::<_, i64>(9)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// BFS over the org's edges from `start`, bounded by `max_depth`.
    /// Returns the reachable node set including `start`.
    pub fn connected(&self, org_id: &str, start: &str, max_depth: usize) -> Result<HashSet<String>> {
        let adjacency = build_adjacency(&self.edges_for_org(org_id)?);

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        visited.insert(start.to_string());
        queue.push_back((start.to_string(), 0));

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&node) {
                for neighbor in neighbors {
                    if visited.insert(neighbor.clone()) {
                        queue.push_back((neighbor.clone(), depth + 1));
                    }
                }
            }
        }
        Ok(visited)
    }

    /// Structure of the depth-5 neighborhood around a user: density,
    /// weighted centrality, and greedy-modularity communities.
    pub fn ring_analysis(&self, org_id: &str, user_id: &str) -> Result<RingAnalysis> {
        let members = self.connected(org_id, user_id, 5)?;
        let edges = self.edges_for_org(org_id)?;
        let subgraph_edges: Vec<&UserConnection> = edges
            .iter()
            .filter(|e| members.contains(&e.user_a) && members.contains(&e.user_b))
            .collect();

        let mut nodes: Vec<String> = members.into_iter().collect();
        nodes.sort();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let pairs: Vec<(usize, usize, f64)> = subgraph_edges
            .iter()
            .map(|e| (index[e.user_a.as_str()], index[e.user_b.as_str()], e.strength))
            .collect();
        let subgraph = Subgraph::new(nodes.clone(), &pairs);

        let betweenness = subgraph.betweenness();
        let closeness = subgraph.closeness();
        let mut centrality: Vec<NodeCentrality> = nodes
            .iter()
            .enumerate()
            .map(|(i, user)| NodeCentrality {
                user_id: user.clone(),
                betweenness: betweenness[i],
                closeness: closeness[i],
            })
            .collect();
        centrality.sort_by(|a, b| {
            b.betweenness
                .partial_cmp(&a.betweenness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let communities = subgraph
            .communities()
            .into_iter()
            .map(|community| community.into_iter().map(|i| nodes[i].clone()).collect())
            .collect();

        Ok(RingAnalysis {
            user_id: user_id.to_string(),
            node_count: subgraph.node_count(),
            edge_count: subgraph.edge_count(),
            density: subgraph.density(),
            centrality,
            communities,
            flagged_edge_count: subgraph_edges.iter().filter(|e| e.flagged_ring).count(),
        })
    }

    /// Users with the most incident edges.
    pub fn top_hubs(&self, org_id: &str, limit: usize) -> Result<Vec<HubInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS connections FROM (
                 SELECT user_a AS user_id FROM user_connections WHERE org_id = ?1
                 UNION ALL
                 SELECT user_b AS user_id FROM user_connections WHERE org_id = ?1
             )
             GROUP BY user_id
             ORDER BY connections DESC, user_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![org_id, limit as i64], |row| {
            Ok(HubInfo {
                user_id: row.get(0)?,
                connection_count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Node/edge lists for visualization, with each node badged by the
    /// user's most recent decision risk level.
    pub fn graph_data(
        &self,
        org_id: &str,
        user_id: &str,
        decisions: &DecisionStore,
    ) -> Result<GraphData> {
        let members = self.connected(org_id, user_id, 3)?;
        let edges = self.edges_for_org(org_id)?;

        let mut nodes: Vec<String> = members.iter().cloned().collect();
        nodes.sort();

        let graph_nodes = nodes
            .iter()
            .map(|user| {
                let risk_level = decisions
                    .latest_level(org_id, user)
                    .unwrap_or(None)
                    .unwrap_or(RiskLevel::Low);
                GraphNode {
                    id: user.clone(),
                    risk_level,
                }
            })
            .collect();

        let graph_edges = edges
            .iter()
            .filter(|e| members.contains(&e.user_a) && members.contains(&e.user_b))
            .map(|e| GraphEdge {
                source: e.user_a.clone(),
                target: e.user_b.clone(),
                connection_type: e.connection_type.clone(),
                strength: e.strength,
                flagged_ring: e.flagged_ring,
            })
            .collect();

        Ok(GraphData {
            nodes: graph_nodes,
            edges: graph_edges,
        })
    }

    /// Mark every pairwise edge among `users` as part of a confirmed ring.
    /// Returns the number of edges flagged.
    pub fn flag_ring(&self, org_id: &str, users: &[String], reason: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let mut flagged = 0;

        for (i, first) in users.iter().enumerate() {
            for second in users.iter().skip(i + 1) {
                let (a, b) = canonical_pair(first, second);
                flagged += conn.execute(
                    "UPDATE user_connections SET flagged_ring = 1
                     WHERE org_id = ?1 AND user_a = ?2 AND user_b = ?3",
                    params![org_id, a, b],
                )?;
            }
        }

        info!(org_id, users = users.len(), flagged, reason, "Ring flagged");
        Ok(flagged)
    }
}

fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

fn build_adjacency(edges: &[UserConnection]) -> HashMap<String, Vec<String>> {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.user_a.clone())
            .or_default()
            .push(edge.user_b.clone());
        adjacency
            .entry(edge.user_b.clone())
            .or_default()
            .push(edge.user_a.clone());
    }
    adjacency
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
