//! Subgraph analysis
//! Mission: Centrality and community structure over small fraud-ring subgraphs

use std::collections::BinaryHeap;

/// Edge arena entry: endpoints by node index plus the retained strength.
/// Nodes are never embedded in edges, so the undirected multigraph stays
/// cycle-free from the borrow checker's point of view.
#[derive(Debug, Clone, Copy)]
pub struct EdgeRef {
    pub a: usize,
    pub b: usize,
    pub strength: f64,
}

/// In-memory subgraph: node list, edge arena, adjacency lists of
/// `(neighbor, edge index)` pairs.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub nodes: Vec<String>,
    pub edges: Vec<EdgeRef>,
    pub adj: Vec<Vec<(usize, usize)>>,
}

/// Traversal length of an edge: stronger connections are "closer".
fn edge_length(strength: f64) -> f64 {
    1.0 / strength.clamp(1.0, 100.0)
}

impl Subgraph {
    pub fn new(nodes: Vec<String>, pairs: &[(usize, usize, f64)]) -> Self {
        let mut edges = Vec::with_capacity(pairs.len());
        let mut adj = vec![Vec::new(); nodes.len()];
        for &(a, b, strength) in pairs {
            let idx = edges.len();
            edges.push(EdgeRef { a, b, strength });
            adj[a].push((b, idx));
            adj[b].push((a, idx));
        }
        Self { nodes, edges, adj }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edge density of the undirected simple graph: `2E / (N(N-1))`.
    pub fn density(&self) -> f64 {
        let n = self.nodes.len();
        if n < 2 {
            return 0.0;
        }
        (2.0 * self.edges.len() as f64) / (n as f64 * (n - 1) as f64)
    }

    /// Dijkstra from `source` over strength-weighted lengths. Returns
    /// distances, shortest-path counts, and predecessor lists (for Brandes).
    fn shortest_paths(&self, source: usize) -> (Vec<f64>, Vec<f64>, Vec<Vec<usize>>, Vec<usize>) {
        let n = self.nodes.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut sigma = vec![0.0; n];
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut settled_order = Vec::with_capacity(n);
        let mut settled = vec![false; n];

        dist[source] = 0.0;
        sigma[source] = 1.0;

        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry {
            dist: 0.0,
            node: source,
        });

        while let Some(HeapEntry { dist: d, node }) = heap.pop() {
            if settled[node] {
                continue;
            }
            settled[node] = true;
            settled_order.push(node);

            for &(neighbor, edge_idx) in &self.adj[node] {
                let candidate = d + edge_length(self.edges[edge_idx].strength);
                if candidate < dist[neighbor] - 1e-12 {
                    dist[neighbor] = candidate;
                    sigma[neighbor] = sigma[node];
                    preds[neighbor] = vec![node];
                    heap.push(HeapEntry {
                        dist: candidate,
                        node: neighbor,
                    });
                } else if (candidate - dist[neighbor]).abs() <= 1e-12 {
                    sigma[neighbor] += sigma[node];
                    preds[neighbor].push(node);
                }
            }
        }

        (dist, sigma, preds, settled_order)
    }

    /// Weighted betweenness centrality (Brandes), normalized for an
    /// undirected graph.
    pub fn betweenness(&self) -> Vec<f64> {
        let n = self.nodes.len();
        let mut centrality = vec![0.0; n];
        if n < 3 {
            return centrality;
        }

        for source in 0..n {
            let (_, sigma, preds, order) = self.shortest_paths(source);
            let mut delta = vec![0.0; n];

            for &w in order.iter().rev() {
                for &v in &preds[w] {
                    if sigma[w] > 0.0 {
                        delta[v] += (sigma[v] / sigma[w]) * (1.0 + delta[w]);
                    }
                }
                if w != source {
                    centrality[w] += delta[w];
                }
            }
        }

        // Undirected: every pair counted twice; normalize to [0, 1].
        let scale = 1.0 / ((n - 1) as f64 * (n - 2) as f64);
        for value in &mut centrality {
            *value *= scale;
        }
        centrality
    }

    /// Weighted closeness centrality: `(reachable) / Σ distance`, scaled by
    /// the reachable fraction so disconnected parts do not inflate scores.
    pub fn closeness(&self) -> Vec<f64> {
        let n = self.nodes.len();
        let mut centrality = vec![0.0; n];
        if n < 2 {
            return centrality;
        }

        for node in 0..n {
            let (dist, _, _, _) = self.shortest_paths(node);
            let mut total = 0.0;
            let mut reachable = 0usize;
            for (other, &d) in dist.iter().enumerate() {
                if other != node && d.is_finite() {
                    total += d;
                    reachable += 1;
                }
            }
            if reachable > 0 && total > 0.0 {
                let fraction = reachable as f64 / (n - 1) as f64;
                centrality[node] = (reachable as f64 / total) * fraction;
            }
        }
        centrality
    }

    /// Greedy modularity communities: start singleton, repeatedly merge the
    /// pair of connected communities with the largest modularity gain.
    /// Practical for the small depth-bounded subgraphs ring analysis uses.
    pub fn communities(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }
        let total_weight: f64 = self.edges.iter().map(|e| e.strength).sum();
        if total_weight == 0.0 {
            return (0..n).map(|i| vec![i]).collect();
        }

        let mut membership: Vec<usize> = (0..n).collect();

        loop {
            let degree = self.community_degrees(&membership);
            let m2 = 2.0 * total_weight;

            // Cross-community edge weight per adjacent pair.
            let mut between: std::collections::HashMap<(usize, usize), f64> = Default::default();
            for edge in &self.edges {
                let ca = membership[edge.a];
                let cb = membership[edge.b];
                if ca != cb {
                    *between.entry((ca.min(cb), ca.max(cb))).or_insert(0.0) += edge.strength;
                }
            }

            let mut best_gain = 0.0;
            let mut best_pair: Option<(usize, usize)> = None;
            for (&(ca, cb), &weight) in &between {
                let gain = weight / total_weight
                    - 2.0 * (degree.get(&ca).copied().unwrap_or(0.0) / m2)
                        * (degree.get(&cb).copied().unwrap_or(0.0) / m2);
                if gain > best_gain + 1e-12 {
                    best_gain = gain;
                    best_pair = Some((ca, cb));
                }
            }

            match best_pair {
                Some((keep, fold)) => {
                    for m in membership.iter_mut() {
                        if *m == fold {
                            *m = keep;
                        }
                    }
                }
                None => break,
            }
        }

        let mut grouped: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
        for (node, &community) in membership.iter().enumerate() {
            grouped.entry(community).or_default().push(node);
        }
        grouped.into_values().collect()
    }

    fn community_degrees(&self, membership: &[usize]) -> std::collections::HashMap<usize, f64> {
        let mut degree: std::collections::HashMap<usize, f64> = Default::default();
        for edge in &self.edges {
            *degree.entry(membership[edge.a]).or_insert(0.0) += edge.strength;
            *degree.entry(membership[edge.b]).or_insert(0.0) += edge.strength;
        }
        degree
    }
}

/// Min-heap entry over f64 distances.
struct HeapEntry {
    dist: f64,
    node: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for a min-heap on distance.
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("u_{i}")).collect()
    }

    #[test]
    fn test_density() {
        // Triangle: fully dense.
        let g = Subgraph::new(names(3), &[(0, 1, 50.0), (1, 2, 50.0), (0, 2, 50.0)]);
        assert!((g.density() - 1.0).abs() < 1e-9);

        // Path of three: 2 of 3 possible edges.
        let g = Subgraph::new(names(3), &[(0, 1, 50.0), (1, 2, 50.0)]);
        assert!((g.density() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_betweenness_path_center() {
        // u_1 sits on every shortest path of a 3-node chain.
        let g = Subgraph::new(names(3), &[(0, 1, 50.0), (1, 2, 50.0)]);
        let b = g.betweenness();
        assert!(b[1] > b[0]);
        assert!(b[1] > b[2]);
        assert!((b[0] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_betweenness_star_hub() {
        // Star: the hub carries all pair paths.
        let g = Subgraph::new(
            names(5),
            &[(0, 1, 50.0), (0, 2, 50.0), (0, 3, 50.0), (0, 4, 50.0)],
        );
        let b = g.betweenness();
        assert!((b[0] - 1.0).abs() < 1e-9);
        for leaf in 1..5 {
            assert!((b[leaf] - 0.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_closeness_prefers_center() {
        let g = Subgraph::new(names(3), &[(0, 1, 50.0), (1, 2, 50.0)]);
        let c = g.closeness();
        assert!(c[1] > c[0]);
        assert!((c[0] - c[2]).abs() < 1e-9);
    }

    #[test]
    fn test_closeness_penalizes_disconnected() {
        // Node 3 is isolated: zero closeness, others scaled down.
        let g = Subgraph::new(names(4), &[(0, 1, 50.0), (1, 2, 50.0)]);
        let c = g.closeness();
        assert_eq!(c[3], 0.0);
        assert!(c[1] > 0.0);
    }

    #[test]
    fn test_communities_split_two_cliques() {
        // Two triangles joined by one weak bridge.
        let g = Subgraph::new(
            names(6),
            &[
                (0, 1, 90.0),
                (1, 2, 90.0),
                (0, 2, 90.0),
                (3, 4, 90.0),
                (4, 5, 90.0),
                (3, 5, 90.0),
                (2, 3, 5.0),
            ],
        );
        let communities = g.communities();
        assert_eq!(communities.len(), 2);
        let mut sizes: Vec<usize> = communities.iter().map(|c| c.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![3, 3]);
    }

    #[test]
    fn test_stronger_edges_are_shorter() {
        assert!(edge_length(90.0) < edge_length(10.0));
        // Strengths clamp into [1, 100].
        assert_eq!(edge_length(0.0), edge_length(1.0));
        assert_eq!(edge_length(500.0), edge_length(100.0));
    }
}
