//! Cluster storage: centroids, per-example assignments and the reverse index.
//!
//! Cluster ids are dense: cluster `local` of class `class` has global id
//! `class * k + local`, so the class of any cluster is `id / k`.

/// Global cluster id for local cluster `local` of `class`.
pub const fn cluster_id(class: usize, local: usize, k: usize) -> usize {
    class * k + local
}

/// Class index owning a global cluster id.
pub const fn class_of_cluster(cluster: usize, k: usize) -> usize {
    cluster / k
}

/// Squared Euclidean distance between two points of equal length.
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Snapshot of one clustering pass over the full embedding table.
///
/// Replaced wholesale on every recluster; never patched in place.
#[derive(Debug, Clone)]
pub struct ClusterState {
    /// Clusters per class.
    k: usize,
    /// Embedding dimensionality observed when the state was built.
    dim: usize,
    /// Row-major `num_clusters × dim` centroid table.
    centroids: Vec<f64>,
    /// Global cluster id of every example.
    assignments: Vec<usize>,
    /// Reverse index: example indices per cluster, ascending.
    members: Vec<Vec<usize>>,
    /// Class index of every cluster.
    cluster_classes: Vec<usize>,
}

impl ClusterState {
    /// Assemble a state from a centroid table and assignments, deriving
    /// the reverse index and the cluster → class map.
    ///
    /// `centroids.len()` must be `num_classes * k * dim` and every
    /// assignment must be below `num_classes * k`; the caller
    /// (`ClusterManager`) guarantees both.
    pub fn from_parts(
        num_classes: usize,
        k: usize,
        dim: usize,
        centroids: Vec<f64>,
        assignments: Vec<usize>,
    ) -> Self {
        let num_clusters = num_classes * k;
        debug_assert_eq!(centroids.len(), num_clusters * dim);

        let mut members = vec![Vec::new(); num_clusters];
        for (example, &cluster) in assignments.iter().enumerate() {
            members[cluster].push(example);
        }

        Self {
            k,
            dim,
            centroids,
            assignments,
            members,
            cluster_classes: (0..num_clusters).map(|c| class_of_cluster(c, k)).collect(),
        }
    }

    /// Clusters per class.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Total number of clusters (`C * k`).
    pub fn num_clusters(&self) -> usize {
        self.cluster_classes.len()
    }

    /// Embedding dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of examples covered by the assignment table.
    pub fn num_examples(&self) -> usize {
        self.assignments.len()
    }

    /// Centroid of cluster `c`.
    pub fn centroid(&self, c: usize) -> &[f64] {
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    /// Flat row-major centroid table.
    pub fn centroids(&self) -> &[f64] {
        &self.centroids
    }

    /// Iterate centroids in cluster-id order.
    pub fn centroid_rows(&self) -> impl Iterator<Item = &[f64]> {
        // dim == 0 would make chunks_exact panic; such a state has no centroids anyway
        self.centroids.chunks_exact(self.dim.max(1))
    }

    /// Cluster assigned to example `i`.
    pub fn assignment(&self, example: usize) -> usize {
        self.assignments[example]
    }

    /// Cluster of every example.
    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    /// Examples currently assigned to cluster `c`.
    pub fn members(&self, c: usize) -> &[usize] {
        &self.members[c]
    }

    /// Class index of cluster `c`.
    pub fn class_of(&self, c: usize) -> usize {
        self.cluster_classes[c]
    }

    /// Class index of every cluster.
    pub fn cluster_classes(&self) -> &[usize] {
        &self.cluster_classes
    }

    /// Clusters with no members.
    pub fn empty_clusters(&self) -> Vec<usize> {
        (0..self.num_clusters())
            .filter(|&c| self.members[c].is_empty())
            .collect()
    }

    /// Squared distance from `point` to every centroid.
    pub fn distances_from(&self, point: &[f64]) -> Vec<f64> {
        self.centroid_rows()
            .map(|centroid| squared_distance(point, centroid))
            .collect()
    }

    /// Cluster whose centroid is closest to `point` (lowest id wins ties).
    pub fn nearest_cluster(&self, point: &[f64]) -> usize {
        let mut best = 0usize;
        let mut best_dist = f64::MAX;
        for (c, centroid) in self.centroid_rows().enumerate() {
            let dist = squared_distance(point, centroid);
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }

    /// Whether the reverse index is the exact inverse of the assignments.
    pub fn is_consistent(&self) -> bool {
        let listed: usize = self.members.iter().map(Vec::len).sum();
        listed == self.assignments.len()
            && self.members.iter().enumerate().all(|(c, examples)| {
                examples
                    .iter()
                    .all(|&i| self.assignments.get(i) == Some(&c))
            })
    }
}
