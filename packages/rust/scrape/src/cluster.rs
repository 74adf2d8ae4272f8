//! Spatial clustering of text blocks and selection of the main-content clusters.

use crate::layout::Rect;

/// Tuning knobs for clustering and cluster selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterThresholds {
    /// Share (percent of text) above which the selected clusters are the main content.
    pub dominance: f64,
    /// Clusters under this share are ignored.
    pub floor: f64,
    /// Clusters whose share is strictly within this many points of the top one are peers.
    pub tolerance: f64,
    /// Maximum gap in pixels between neighbouring blocks.
    pub epsilon: f64,
    /// Neighbours a block needs to seed a cluster.
    pub min_points: usize,
}

impl Default for ClusterThresholds {
    fn default() -> Self {
        Self {
            dominance: 60.0,
            floor: 2.0,
            tolerance: 10.0,
            epsilon: 28.0,
            min_points: 2,
        }
    }
}

/// A text block considered for clustering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    pub rect: Rect,
    pub text_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices into the clustered blocks, ascending.
    pub members: Vec<usize>,
    pub rect: Rect,
    pub text_len: usize,
    /// Percent of all clustered text, rounded to two decimals.
    pub share: f64,
}

/// Group rectangles with DBSCAN. Noise points belong to no cluster.
///
/// A point is a core point when at least `min_points` other points lie
/// strictly closer than `epsilon`.
pub fn dbscan(rects: &[Rect], epsilon: f64, min_points: usize) -> Vec<Vec<usize>> {
    let neighbours = |i: usize| -> Vec<usize> {
        (0..rects.len())
            .filter(|&j| j != i && rects[i].gap(&rects[j]) < epsilon)
            .collect()
    };

    let mut visited = vec![false; rects.len()];
    let mut label: Vec<Option<usize>> = vec![None; rects.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..rects.len() {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seeds = neighbours(i);
        if seeds.len() < min_points {
            continue;
        }

        let cluster_id = clusters.len();
        let mut members = vec![i];
        label[i] = Some(cluster_id);

        let mut queue = seeds;
        while let Some(j) = queue.pop() {
            if !visited[j] {
                visited[j] = true;
                let more = neighbours(j);
                if more.len() >= min_points {
                    queue.extend(more);
                }
            }
            if label[j].is_none() {
                label[j] = Some(cluster_id);
                members.push(j);
            }
        }

        members.sort_unstable();
        clusters.push(members);
    }

    clusters
}

/// Cluster blocks and compute each cluster's bounding box and text share.
pub fn build_clusters(blocks: &[Block], thresholds: &ClusterThresholds) -> Vec<Cluster> {
    let rects: Vec<Rect> = blocks.iter().map(|b| b.rect).collect();
    let groups = dbscan(&rects, thresholds.epsilon, thresholds.min_points);

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter_map(|members| {
            let first = *members.first()?;
            let rect = members
                .iter()
                .skip(1)
                .fold(blocks[first].rect, |acc, &m| acc.union(&blocks[m].rect));
            let text_len = members.iter().map(|&m| blocks[m].text_len).sum();
            Some(Cluster {
                members,
                rect,
                text_len,
                share: 0.0,
            })
        })
        .collect();

    let total: usize = clusters.iter().map(|c| c.text_len).sum();
    if total > 0 {
        for cluster in &mut clusters {
            cluster.share = round2(cluster.text_len as f64 / total as f64 * 100.0);
        }
    }
    clusters
}

/// Pick the clusters that together make up the page's main content.
///
/// Returns an empty list when no combination reaches the dominance share.
pub fn critical_clusters(
    clusters: &[Cluster],
    viewport_width: f64,
    thresholds: &ClusterThresholds,
) -> Vec<Cluster> {
    let Some(largest) = clusters
        .iter()
        .max_by(|a, b| a.share.total_cmp(&b.share))
    else {
        return Vec::new();
    };
    if largest.share > thresholds.dominance {
        return vec![largest.clone()];
    }

    let centre = viewport_width / 2.0;
    let score = |c: &Cluster| c.share * 0.9_f64.powf(centrality(&c.rect, centre) / 100.0);

    let mut ranked: Vec<&Cluster> = clusters
        .iter()
        .filter(|c| c.share >= thresholds.floor)
        .collect();
    ranked.sort_by(|a, b| score(b).total_cmp(&score(a)));

    let Some(top) = ranked.first() else {
        return Vec::new();
    };

    let peers: Vec<&Cluster> = ranked
        .iter()
        .copied()
        .filter(|c| (c.share - top.share).abs() < thresholds.tolerance)
        .collect();
    let peer_share: f64 = peers.iter().map(|c| c.share).sum();
    if peer_share > thresholds.dominance {
        return peers.into_iter().cloned().collect();
    }

    let mut selected = Vec::new();
    let mut accumulated = 0.0;
    for cluster in ranked {
        accumulated += cluster.share;
        selected.push(cluster.clone());
        if accumulated > thresholds.dominance {
            break;
        }
    }

    if accumulated >= thresholds.dominance {
        selected
    } else {
        Vec::new()
    }
}

/// Horizontal distance from the viewport centre, 0 when the box straddles it.
fn centrality(rect: &Rect, centre: f64) -> f64 {
    if rect.x <= centre && centre <= rect.right() {
        0.0
    } else {
        (rect.x - centre).abs().min((rect.right() - centre).abs())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
