//! Multi-node test clusters over the in-memory network.

use crate::cache::InMemoryStore;
use crate::cluster::{MembershipGroup, View};
use crate::config::ClusterConfig;
use crate::dispatcher::CommandDispatcherFactory;
use crate::expiration::{ExpirationListener, ExpirationMetaData, ExpirationScheduler};
use crate::testing::network::InMemoryNetwork;
use crate::types::Node;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// First port handed out to test nodes. Nothing listens on it.
const BASE_PORT: u16 = 17_000;

/// Records the ids a node expired.
#[derive(Debug, Default)]
pub struct ExpiredRecorder {
    expired: Mutex<Vec<String>>,
}

impl ExpiredRecorder {
    /// Ids expired so far, in order.
    pub fn expired(&self) -> Vec<String> {
        self.expired.lock().clone()
    }
}

impl ExpirationListener<String> for ExpiredRecorder {
    fn expired(&self, id: &String, _metadata: &ExpirationMetaData) {
        self.expired.lock().push(id.clone());
    }
}

/// One member of a `TestCluster`.
pub struct TestNode {
    /// The member.
    pub node: Node,
    /// Its group.
    pub group: Arc<MembershipGroup>,
    /// Its dispatcher factory.
    pub factory: Arc<CommandDispatcherFactory>,
    /// Its expiration scheduler.
    pub expiration: ExpirationScheduler<String>,
    /// Removals performed on this member.
    pub recorder: Arc<ExpiredRecorder>,
}

impl TestNode {
    /// Start a node from `config`, attached to `network`.
    pub fn start(
        config: &ClusterConfig,
        network: &Arc<InMemoryNetwork>,
        store: Arc<InMemoryStore<String, ExpirationMetaData>>,
    ) -> Self {
        let node = Node::new(config.node_name.clone(), config.bind_addr);
        let group = MembershipGroup::new(node.clone(), config.group.clone());
        let factory = CommandDispatcherFactory::new(
            group.clone(),
            network.transport(&node),
            config.dispatcher.clone(),
        );
        network.attach(&factory);

        let expiration = ExpirationScheduler::new(
            &factory,
            store,
            config.expiration.clone(),
            config.scheduler.clone(),
        )
        .expect("expiration service deploys on a fresh factory");
        let recorder = Arc::new(ExpiredRecorder::default());
        expiration.add_listener(recorder.clone());

        Self {
            node,
            group,
            factory,
            expiration,
            recorder,
        }
    }

    /// Stop every component of the node.
    pub fn shutdown(&self) {
        self.expiration.close();
        self.factory.close();
        self.group.close();
    }
}

/// A group of nodes sharing one network and one metadata store.
///
/// The shared store stands in for a replicated cache: every member sees the
/// same entries, and each removal happens once for the whole cluster.
pub struct TestCluster {
    /// The network connecting the nodes.
    pub network: Arc<InMemoryNetwork>,
    /// The metadata store shared by all nodes.
    pub store: Arc<InMemoryStore<String, ExpirationMetaData>>,
    /// The nodes, by index.
    pub nodes: Vec<TestNode>,
    timeout: Duration,
}

impl TestCluster {
    /// Start `node_count` nodes with the given expiration timeout and install
    /// a view containing all of them.
    pub async fn new(node_count: usize, timeout: Duration) -> Self {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            store: Arc::new(InMemoryStore::new()),
            nodes: Vec::with_capacity(node_count),
            timeout,
        };

        for _ in 0..node_count {
            let node = TestNode::start(&cluster.next_config(), &cluster.network, cluster.store.clone());
            cluster.nodes.push(node);
        }

        let all: Vec<usize> = (0..node_count).collect();
        cluster.install(&all).await;
        cluster
    }

    fn next_config(&self) -> ClusterConfig {
        let index = self.nodes.len();
        let addr = SocketAddr::from(([127, 0, 0, 1], BASE_PORT + index as u16));
        let mut config = ClusterConfig::new(format!("node-{}", index), addr);
        config.expiration = config.expiration.with_default_timeout(self.timeout);
        config
    }

    /// Members at `indices`.
    pub fn members(&self, indices: &[usize]) -> Vec<Node> {
        indices.iter().map(|&i| self.nodes[i].node.clone()).collect()
    }

    /// Index of `node`.
    pub fn index_of(&self, node: &Node) -> usize {
        self.nodes
            .iter()
            .position(|n| n.node == *node)
            .expect("node belongs to the cluster")
    }

    /// Install a view of the nodes at `indices` on each of them, and wait for
    /// the notifications to be delivered.
    pub async fn install(&self, indices: &[usize]) -> Arc<View> {
        let members = self.members(indices);
        let mut installed = None;
        for &i in indices {
            installed = Some(self.nodes[i].group.install_view(members.clone()));
        }
        self.flush(indices).await;
        installed.expect("at least one member")
    }

    /// Merge `subviews` on every node they contain.
    pub async fn merge(&self, subviews: &[Arc<View>]) -> Arc<View> {
        let indices: Vec<usize> = subviews
            .iter()
            .flat_map(|view| view.members().iter().map(|node| self.index_of(node)))
            .collect();

        let mut merged = None;
        for &i in &indices {
            merged = Some(self.nodes[i].group.merge_views(subviews));
        }
        self.flush(&indices).await;
        merged.expect("at least one member")
    }

    /// Start a new node and install a view with every running node.
    pub async fn join(&mut self) -> usize {
        let node = TestNode::start(&self.next_config(), &self.network, self.store.clone());
        self.nodes.push(node);

        let running = self.running();
        self.install(&running).await;
        self.nodes.len() - 1
    }

    /// Stop node `index` and install a view without it on the others.
    pub async fn leave(&self, index: usize) {
        let leaving = &self.nodes[index];
        leaving.shutdown();
        self.network.detach(&leaving.node.addr);

        let remaining: Vec<usize> = self
            .running()
            .into_iter()
            .filter(|&i| i != index)
            .collect();
        self.install(&remaining).await;
    }

    /// Indices of nodes that have not been shut down.
    pub fn running(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].factory.is_closed())
            .collect()
    }

    async fn flush(&self, indices: &[usize]) {
        for &i in indices {
            self.nodes[i].group.flush().await;
        }
    }

    /// Store `id` as accessed now and schedule its expiration from node
    /// `from`.
    pub fn touch(&self, from: usize, id: &str) -> ExpirationMetaData {
        let metadata = ExpirationMetaData::new(Some(self.timeout), SystemTime::now());
        self.store.insert(id.to_string(), metadata);
        self.nodes[from].expiration.schedule(id.to_string(), metadata);
        metadata
    }

    /// Index of the node owning `id`, as seen from node `from`.
    pub fn owner_index(&self, from: usize, id: &str) -> usize {
        let owner = self.nodes[from]
            .expiration
            .owner(&id.to_string())
            .expect("non-empty view");
        self.index_of(&owner)
    }

    /// Removals across all nodes.
    pub fn total_removed(&self) -> u64 {
        self.nodes.iter().map(|n| n.expiration.removed()).sum()
    }

    /// Shut down every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
