//! Reverse indexes over the manifest graph.
//!
//! Manifests reference their children by descriptor; these structures record
//! the opposite direction. The graph is an approximate mirror of the DAG,
//! built lazily as manifests are pushed: a node appears only once it is the
//! source or the target of an indexed edge.
//!
//! Two variants exist. The append-only [`PredecessorGraph`] never forgets
//! and backs every store that cannot delete. The [`DeletableGraph`] also
//! records forward edges so that removing a manifest can retract the edges
//! it contributed. They share shape but not implementation; the append-only
//! one stays simpler and cheaper for it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use oci_content::{is_manifest, successors, ContentKey, Descriptor};
use tracing::debug;

use crate::errors::{Result, StoreError};
use crate::sync::limited_map;
use crate::Fetcher;

/// Upper bound on concurrent fetches during a transitive index.
const TRAVERSAL_LIMIT: usize = 8;

type PredecessorMap = HashMap<ContentKey, HashMap<ContentKey, Descriptor>>;

fn record_edges(
    predecessors: &mut PredecessorMap,
    node: &Descriptor,
    children: &[Descriptor],
) {
    let node_key = node.content_key();
    for child in children {
        predecessors
            .entry(child.content_key())
            .or_default()
            .entry(node_key.clone())
            .or_insert_with(|| node.clone());
    }
}

fn predecessors_of(predecessors: &PredecessorMap, node: &Descriptor) -> Vec<Descriptor> {
    predecessors
        .get(&node.content_key())
        .map(|set| set.values().cloned().collect())
        .unwrap_or_default()
}

/// Fetches and parses one manifest, returning its children.
///
/// `tolerate_missing` is how a transitive walk skips subtrees whose content
/// never arrived; a direct push of a manifest must not tolerate that.
async fn fetch_successors<F: Fetcher + ?Sized>(
    fetcher: &F,
    node: &Descriptor,
    tolerate_missing: bool,
) -> Result<Option<Vec<Descriptor>>> {
    let reader = match fetcher.fetch(node).await {
        Ok(reader) => reader,
        Err(err) if tolerate_missing && err.is_not_found() => {
            debug!(digest = %node.digest, "skipping unindexed subtree: content not present");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    let content = oci_content::read_all(reader, node).await?;
    Ok(Some(successors(node, &content)?))
}

/// The append-only predecessor index.
pub struct PredecessorGraph {
    inner: RwLock<AppendOnlyMaps>,
}

#[derive(Default)]
struct AppendOnlyMaps {
    predecessors: PredecessorMap,
    indexed: HashSet<ContentKey>,
}

impl PredecessorGraph {
    /// Creates an empty graph.
    pub fn new() -> PredecessorGraph {
        PredecessorGraph {
            inner: RwLock::new(AppendOnlyMaps::default()),
        }
    }

    /// Records the edges from `node` to each of its already-parsed children.
    pub fn index_parsed(&self, node: &Descriptor, children: &[Descriptor]) {
        let mut maps = self.inner.write().expect("graph poisoned");
        record_edges(&mut maps.predecessors, node, children);
        maps.indexed.insert(node.content_key());
    }

    /// Indexes a single node: manifests are fetched, parsed, and their
    /// edges recorded; anything else is a no-op. Indexing is idempotent and
    /// an already-indexed manifest is not parsed again.
    pub async fn index<F: Fetcher + ?Sized>(&self, fetcher: &F, node: &Descriptor) -> Result<()> {
        if !is_manifest(&node.media_type) {
            return Ok(());
        }
        if self.is_indexed(node) {
            return Ok(());
        }
        if let Some(children) = fetch_successors(fetcher, node, false).await? {
            self.index_parsed(node, &children);
        }
        Ok(())
    }

    /// Indexes `root` and every manifest reachable from it, fetching at most
    /// a few nodes concurrently. Subtrees whose content is missing are
    /// skipped; any other failure aborts the walk.
    pub async fn index_all<F: Fetcher + ?Sized>(&self, fetcher: &F, root: &Descriptor) -> Result<()> {
        index_all_from(
            fetcher,
            root,
            |key| self.inner.read().expect("graph poisoned").indexed.contains(key),
            |node, children| self.index_parsed(node, children),
        )
        .await
    }

    /// The recorded predecessors of `node`. Unknown nodes yield an empty
    /// list; order is unspecified.
    pub fn predecessors(&self, node: &Descriptor) -> Vec<Descriptor> {
        predecessors_of(
            &self.inner.read().expect("graph poisoned").predecessors,
            node,
        )
    }

    fn is_indexed(&self, node: &Descriptor) -> bool {
        self.inner
            .read()
            .expect("graph poisoned")
            .indexed
            .contains(&node.content_key())
    }
}

impl Default for PredecessorGraph {
    fn default() -> Self {
        PredecessorGraph::new()
    }
}

/// The deletable predecessor index, which additionally remembers each
/// indexed manifest's own children so its edges can be retracted.
pub struct DeletableGraph {
    inner: RwLock<DeletableMaps>,
}

#[derive(Default)]
struct DeletableMaps {
    predecessors: PredecessorMap,
    successors: HashMap<ContentKey, HashSet<ContentKey>>,
    indexed: HashSet<ContentKey>,
}

impl DeletableGraph {
    /// Creates an empty graph.
    pub fn new() -> DeletableGraph {
        DeletableGraph {
            inner: RwLock::new(DeletableMaps::default()),
        }
    }

    /// Records the edges from `node` to each of its already-parsed children.
    pub fn index_parsed(&self, node: &Descriptor, children: &[Descriptor]) {
        let mut maps = self.inner.write().expect("graph poisoned");
        record_edges(&mut maps.predecessors, node, children);
        let node_key = node.content_key();
        let forward = maps.successors.entry(node_key.clone()).or_default();
        for child in children {
            forward.insert(child.content_key());
        }
        maps.indexed.insert(node_key);
    }

    /// See [`PredecessorGraph::index`].
    pub async fn index<F: Fetcher + ?Sized>(&self, fetcher: &F, node: &Descriptor) -> Result<()> {
        if !is_manifest(&node.media_type) {
            return Ok(());
        }
        if self.is_indexed(node) {
            return Ok(());
        }
        if let Some(children) = fetch_successors(fetcher, node, false).await? {
            self.index_parsed(node, &children);
        }
        Ok(())
    }

    /// See [`PredecessorGraph::index_all`].
    pub async fn index_all<F: Fetcher + ?Sized>(&self, fetcher: &F, root: &Descriptor) -> Result<()> {
        index_all_from(
            fetcher,
            root,
            |key| self.inner.read().expect("graph poisoned").indexed.contains(key),
            |node, children| self.index_parsed(node, children),
        )
        .await
    }

    /// See [`PredecessorGraph::predecessors`].
    pub fn predecessors(&self, node: &Descriptor) -> Vec<Descriptor> {
        predecessors_of(
            &self.inner.read().expect("graph poisoned").predecessors,
            node,
        )
    }

    /// Retracts the edges `node` contributed: `node` disappears from the
    /// predecessor sets of its own children. Edges *into* `node` are left
    /// alone; they belong to manifests that still exist.
    pub fn remove(&self, node: &Descriptor) {
        let mut maps = self.inner.write().expect("graph poisoned");
        let node_key = node.content_key();
        if let Some(children) = maps.successors.remove(&node_key) {
            for child in children {
                if let Some(set) = maps.predecessors.get_mut(&child) {
                    set.remove(&node_key);
                    if set.is_empty() {
                        maps.predecessors.remove(&child);
                    }
                }
            }
        }
        maps.indexed.remove(&node_key);
    }

    fn is_indexed(&self, node: &Descriptor) -> bool {
        self.inner
            .read()
            .expect("graph poisoned")
            .indexed
            .contains(&node.content_key())
    }
}

impl Default for DeletableGraph {
    fn default() -> Self {
        DeletableGraph::new()
    }
}

/// Breadth-first transitive indexing shared by both graph variants.
///
/// Each node is visited at most once per walk, and a node that a previous
/// walk already indexed prunes its whole subtree (manifests are immutable,
/// so its edges cannot have changed).
async fn index_all_from<F, I, R>(
    fetcher: &F,
    root: &Descriptor,
    already_indexed: I,
    record: R,
) -> Result<()>
where
    F: Fetcher + ?Sized,
    I: Fn(&ContentKey) -> bool + Sync,
    R: Fn(&Descriptor, &[Descriptor]) + Sync,
{
    let record = &record;
    let mut visited: HashSet<ContentKey> = HashSet::new();
    visited.insert(root.content_key());
    let mut frontier = vec![root.clone()];

    while !frontier.is_empty() {
        let level: Vec<Vec<Descriptor>> = limited_map(TRAVERSAL_LIMIT, frontier, |node| {
            let already = already_indexed(&node.content_key());
            async move {
                if !is_manifest(&node.media_type) || already {
                    return Ok::<_, StoreError>(Vec::new());
                }
                match fetch_successors(fetcher, &node, true).await? {
                    Some(children) => {
                        record(&node, &children);
                        Ok(children)
                    }
                    None => Ok(Vec::new()),
                }
            }
        })
        .await?;

        frontier = level
            .into_iter()
            .flatten()
            .filter(|child| visited.insert(child.content_key()))
            .collect();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::MemoryCas;
    use crate::Storage;
    use oci_content::manifest::{MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST};

    async fn push(cas: &MemoryCas, desc: &Descriptor, content: &[u8]) {
        cas.push(desc, Box::new(std::io::Cursor::new(content.to_vec())))
            .await
            .expect("push should succeed");
    }

    fn manifest_json(config: &Descriptor, layers: &[&Descriptor]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "config": config,
            "layers": layers,
        }))
        .unwrap()
    }

    fn index_json(manifests: &[&Descriptor]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": manifests,
        }))
        .unwrap()
    }

    fn digests(descs: &[Descriptor]) -> HashSet<String> {
        descs.iter().map(|d| d.digest.to_string()).collect()
    }

    /// Builds the fixture DAG shared by several tests and returns the
    /// descriptors in push order:
    /// blobs, three image manifests over them, and indexes over those.
    async fn build_dag(cas: &MemoryCas, graph: &PredecessorGraph) -> Vec<Descriptor> {
        fn blob(
            descs: &mut Vec<Descriptor>,
            contents: &mut Vec<Vec<u8>>,
            media_type: &str,
            content: Vec<u8>,
        ) {
            descs.push(Descriptor::from_bytes(media_type, &content));
            contents.push(content);
        }

        let mut descs: Vec<Descriptor> = Vec::new();
        let mut contents: Vec<Vec<u8>> = Vec::new();

        blob(&mut descs, &mut contents, "config", b"config".to_vec()); // 0
        blob(&mut descs, &mut contents, "test", b"foo".to_vec()); // 1
        blob(&mut descs, &mut contents, "test", b"bar".to_vec()); // 2
        blob(&mut descs, &mut contents, "test", b"hello".to_vec()); // 3
        let m4 = manifest_json(&descs[0], &[&descs[1], &descs[2]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, m4); // 4
        let m5 = manifest_json(&descs[0], &[&descs[3]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, m5); // 5
        let m6 = manifest_json(&descs[0], &[&descs[1], &descs[2], &descs[3]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, m6); // 6
        let i7 = index_json(&[&descs[4], &descs[5]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, i7); // 7
        let i8 = index_json(&[&descs[6]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, i8); // 8
        let i9 = index_json(&[]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, i9); // 9
        let i10 = index_json(&[&descs[7], &descs[8], &descs[9]]);
        blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, i10); // 10

        for (desc, content) in descs.iter().zip(contents.iter()) {
            push(cas, desc, content).await;
            graph.index(cas, desc).await.expect("index should succeed");
        }
        descs
    }

    #[tokio::test]
    async fn records_reverse_edges_for_a_dag() {
        let cas = MemoryCas::new();
        let graph = PredecessorGraph::new();
        let descs = build_dag(&cas, &graph).await;

        assert_eq!(
            digests(&[descs[10].clone()]),
            digests(&graph.predecessors(&descs[7]))
        );
        assert_eq!(
            digests(&[descs[4].clone(), descs[5].clone(), descs[6].clone()]),
            digests(&graph.predecessors(&descs[0]))
        );
        // The root has no predecessors, and non-manifests contribute none.
        assert!(graph.predecessors(&descs[10]).is_empty());
    }

    #[tokio::test]
    async fn index_all_is_idempotent() {
        let cas = MemoryCas::new();
        let graph = PredecessorGraph::new();
        let descs = build_dag(&cas, &graph).await;

        let before = digests(&graph.predecessors(&descs[0]));
        graph.index_all(&cas, &descs[10]).await.unwrap();
        graph.index_all(&cas, &descs[10]).await.unwrap();
        assert_eq!(before, digests(&graph.predecessors(&descs[0])));
    }

    #[tokio::test]
    async fn index_all_tolerates_missing_subtrees() {
        let cas = MemoryCas::new();
        let graph = PredecessorGraph::new();

        // An index referencing a manifest that was never pushed.
        let ghost = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, b"never pushed");
        let content = index_json(&[&ghost]);
        let root = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_INDEX, &content);
        push(&cas, &root, &content).await;

        graph.index_all(&cas, &root).await.unwrap();
        assert_eq!(
            digests(&[root.clone()]),
            digests(&graph.predecessors(&ghost))
        );
    }

    #[tokio::test]
    async fn direct_index_requires_the_content() {
        let cas = MemoryCas::new();
        let graph = PredecessorGraph::new();
        let ghost = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, b"never pushed");
        let err = graph.index(&cas, &ghost).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn annotated_and_plain_descriptors_share_a_node() {
        let cas = MemoryCas::new();
        let graph = PredecessorGraph::new();

        let config = Descriptor::from_bytes("config", b"c");
        let mut titled = Descriptor::from_bytes("test", b"layer");
        titled.set_annotation(oci_content::ANNOTATION_TITLE, "layer.txt");
        let content = manifest_json(&config, &[&titled]);
        let manifest = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &content);
        push(&cas, &config, b"c").await;
        push(&cas, &manifest, &content).await;
        graph.index(&cas, &manifest).await.unwrap();

        // Querying with a plain copy still finds the node.
        let plain = titled.plain();
        let preds = graph.predecessors(&plain);
        assert_eq!(digests(&[manifest]), digests(&preds));
    }

    #[tokio::test]
    async fn deletable_graph_retracts_only_outgoing_edges() {
        let cas = MemoryCas::new();
        let graph = DeletableGraph::new();

        let config = Descriptor::from_bytes("config", b"c");
        let layer = Descriptor::from_bytes("test", b"l");
        let m1_content = manifest_json(&config, &[&layer]);
        let m1 = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &m1_content);
        let m2_content = manifest_json(&config, &[]);
        let m2 = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &m2_content);
        let idx_content = index_json(&[&m1]);
        let idx = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_INDEX, &idx_content);

        for (desc, content) in [
            (&config, b"c".to_vec()),
            (&layer, b"l".to_vec()),
            (&m1, m1_content.clone()),
            (&m2, m2_content.clone()),
            (&idx, idx_content.clone()),
        ] {
            push(&cas, desc, &content).await;
            graph.index(&cas, desc).await.unwrap();
        }

        assert_eq!(2, graph.predecessors(&config).len());
        graph.remove(&m1);
        // m1's edges are gone...
        assert_eq!(digests(&[m2.clone()]), digests(&graph.predecessors(&config)));
        assert!(graph.predecessors(&layer).is_empty());
        // ...but the edge from the still-live index into m1 survives.
        assert_eq!(digests(&[idx]), digests(&graph.predecessors(&m1)));
    }
}
