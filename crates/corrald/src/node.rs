//! Assembly of one cluster member.
//!
//! [`Node::open`] opens every store and starts the raft node. [`Node::run`]
//! then serves: a member without cluster state only answers on the
//! control socket until the operator bootstraps it or has it join a
//! cluster, after which the cluster API is served on the network and the
//! control socket alike.

use std::ffi::OsString;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tracing::{error, info, warn};

use corral_cluster::tls::{generate_cluster_certificate, generate_server_certificate};
use corral_cluster::{
    CertKeyPair, ClusterContext, ClusterError, Consensus, ExecReplacer, HttpPeerClient,
    HttpTransport, JoinRequest, PeerClient, PeerIdentity, Reconciler, RestartGate, Supervisor,
    node_id_for,
};
use corral_raft::{CorralRaft, LogStore, RaftConsensus, RaftProposer, raft_router, start_raft};
use corral_state::{ClusterMember, Database, Remote, Role, StateStore, TrustStore, fingerprint};

use crate::config::{DaemonConfig, Layout};
use crate::control::{self, MembershipStatus};

/// Schema version this build writes into member records.
pub const SCHEMA_VERSION: u64 = 1;

/// Name embedded in the cluster certificate.
const CLUSTER_NAME: &str = "corral";

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments the daemon is re-executed with after a reset.
///
/// `args` is the full command line, program name first. The program name
/// is dropped, and so is `--bootstrap`: a reset member must wait for the
/// operator rather than form a new cluster on its own.
pub fn restart_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .skip(1)
        .filter(|arg| arg.as_os_str() != "--bootstrap")
        .collect()
}

pub struct Node {
    config: DaemonConfig,
    layout: Layout,
    identity: CertKeyPair,
    transport: HttpTransport,
    trust: Arc<TrustStore>,
    database: Arc<Database>,
    raft: Arc<CorralRaft>,
    consensus: Arc<RaftConsensus>,
    restart_args: Vec<OsString>,
    /// Fired when a control command gives this node cluster state.
    membership: Notify,
}

impl Node {
    /// `restart_args` are handed to the process replacement after a reset;
    /// see [`restart_args`].
    pub async fn open(config: DaemonConfig, restart_args: Vec<OsString>) -> anyhow::Result<Self> {
        config.validate()?;
        let layout = config.layout();
        layout.create()?;

        let identity = CertKeyPair::load_or_generate(&layout.server_cert(), &layout.server_key(), || {
            generate_server_certificate(&config.name, &config.address)
        })?;
        let transport = HttpTransport::new(PeerIdentity {
            name: config.name.clone(),
            fingerprint: fingerprint(&identity.cert_pem),
        });

        let trust = Arc::new(TrustStore::open(&layout.trust_db())?);
        info!(path = ?layout.trust_db(), remotes = trust.count(), "trust store opened");

        let store = StateStore::open(&layout.metadata_db())?;
        info!(path = ?layout.metadata_db(), "metadata store opened");

        let log = LogStore::open(&layout.raft_db())
            .with_context(|| format!("failed to open raft log {}", layout.raft_db().display()))?;

        let node_id = node_id_for(&config.address);
        let raft = start_raft(node_id, log, store.clone(), transport.clone()).await?;
        info!(node_id, address = %config.address, "raft node started");

        let consensus = Arc::new(RaftConsensus::new(raft.clone(), node_id));
        let database = Arc::new(Database::new(store, Arc::new(RaftProposer::new(raft.clone()))));

        Ok(Self {
            config,
            layout,
            identity,
            transport,
            trust,
            database,
            raft,
            consensus,
            restart_args,
            membership: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether this member holds cluster state (bootstrapped or joined).
    pub fn is_member(&self) -> bool {
        self.layout.is_member()
    }

    pub fn status(&self) -> MembershipStatus {
        MembershipStatus {
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            trusted: self.trust.count(),
        }
    }

    pub(crate) fn membership_gained(&self) {
        self.membership.notify_one();
    }

    /// This member, as peers trust it.
    pub fn local(&self) -> Remote {
        Remote {
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            certificate: self.identity.cert_pem.clone(),
        }
    }

    /// Form a single-member cluster led by this node.
    ///
    /// Safe to repeat: every step is skipped once done, and the cluster
    /// certificate is written last so an interrupted bootstrap is retried.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        if self.layout.is_member() {
            info!("cluster state present, skipping bootstrap");
            return Ok(());
        }

        self.consensus.initialize(&self.config.address).await?;
        corral_raft::wait_for_leader(&self.raft, LEADER_TIMEOUT).await?;

        let local = self.local();
        let own = ClusterMember {
            name: local.name.clone(),
            address: local.address.clone(),
            certificate: local.certificate.clone(),
            schema_version: SCHEMA_VERSION,
            heartbeat: corral_state::epoch_secs(),
            role: Role::Voter,
        };
        self.database
            .transaction(|tx| {
                if tx.cluster_member_by_address(&own.address)?.is_none() {
                    tx.create_cluster_member(own)?;
                }
                Ok::<_, ClusterError>(())
            })
            .await?;
        self.trust.add(local)?;

        let cluster = generate_cluster_certificate(CLUSTER_NAME)?;
        cluster.write(&self.layout.cluster_cert(), &self.layout.cluster_key())?;
        info!(member = %self.config.name, "bootstrapped new cluster");
        Ok(())
    }

    /// Ask the member at `via` to admit this node, then adopt the cluster
    /// certificate and member list it hands back.
    pub async fn join(&self, via: &str, secret: &str) -> anyhow::Result<()> {
        if self.layout.is_member() {
            bail!("{} already belongs to a cluster", self.config.name);
        }

        let request = JoinRequest {
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            certificate: self.identity.cert_pem.clone(),
            secret: secret.to_string(),
            schema_version: SCHEMA_VERSION,
        };
        let response = HttpPeerClient::new(self.transport.clone())
            .add_cluster_member(via, &request)
            .await
            .with_context(|| format!("failed to join cluster via {via}"))?;

        let remotes: Vec<Remote> = response.cluster_members.into_iter().map(Remote::from).collect();
        self.trust.replace(remotes)?;
        CertKeyPair {
            cert_pem: response.cluster_cert,
            key_pem: response.cluster_key,
        }
        .write(&self.layout.cluster_cert(), &self.layout.cluster_key())?;
        info!(via, remotes = self.trust.count(), "joined cluster");
        Ok(())
    }

    fn context(&self, cluster_cert: CertKeyPair) -> Arc<ClusterContext> {
        let consensus: Arc<dyn Consensus> = self.consensus.clone();
        let supervisor = Supervisor::new(
            RestartGate::new(),
            consensus.clone(),
            self.trust.clone(),
            self.layout.state_dir(),
            Arc::new(ExecReplacer::new(self.restart_args.clone())),
        );
        Arc::new(ClusterContext {
            local: self.local(),
            cluster_cert,
            database: self.database.clone(),
            trust: self.trust.clone(),
            consensus,
            peers: Arc::new(HttpPeerClient::new(self.transport.clone())),
            supervisor,
            reconcile: Arc::new(Notify::new()),
        })
    }

    /// Serve until Ctrl-C, bootstrapping first if asked to.
    pub async fn run(self: Arc<Self>, bootstrap: bool) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
        self.serve(bootstrap, shutdown_rx).await
    }

    /// Serve until `shutdown` turns true.
    pub async fn serve(self: Arc<Self>, bootstrap: bool, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if bootstrap {
            self.bootstrap().await?;
        }
        if !self.is_member() && !self.await_membership(shutdown.clone()).await? {
            self.shutdown().await;
            info!("corrald stopped");
            return Ok(());
        }

        let cluster_cert = CertKeyPair::load(&self.layout.cluster_cert(), &self.layout.cluster_key())?
            .ok_or_else(|| anyhow!("{} lost its cluster certificate", self.config.name))?;
        self.transport.set_cluster_key(cluster_cert.key_pem.clone());
        let ctx = self.context(cluster_cert);
        let addr = self.config.listen_addr()?;

        let interval = Duration::from_secs(self.config.reconcile_interval_secs);
        let reconciler = tokio::spawn(Reconciler::new(ctx.clone()).run(interval, shutdown.clone()));
        info!(interval_secs = self.config.reconcile_interval_secs, "reconciler started");

        let api = corral_api::build_router(ctx, raft_router(self.raft.clone()));
        let local = corral_api::with_control_socket(api.clone().merge(control::router(self.clone())));

        let socket = control::bind(&self.layout.control_socket())?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, member = %self.config.name, "cluster API listening");

        let network = axum::serve(listener, api).with_graceful_shutdown(stopped(shutdown.clone()));
        let operator = axum::serve(socket, local).with_graceful_shutdown(stopped(shutdown));
        let served = tokio::try_join!(network.into_future(), operator.into_future());

        info!("shutting down");
        if served.is_err() {
            reconciler.abort();
        }
        let _ = reconciler.await;
        self.shutdown().await;
        served?;
        info!("corrald stopped");
        Ok(())
    }

    /// Answer control commands until this node gains cluster state.
    ///
    /// Returns false if `shutdown` fired first.
    async fn await_membership(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<bool> {
        let socket = control::bind(&self.layout.control_socket())?;
        info!(
            member = %self.config.name,
            "no cluster state; waiting for bootstrap or join on the control socket"
        );

        let router = corral_api::with_control_socket(
            control::router(self.clone()).route("/ready", get(corral_api::handlers::ready)),
        );
        let node = self.clone();
        let done = async move {
            tokio::select! {
                () = node.membership.notified() => info!("cluster state acquired"),
                () = stopped(shutdown) => {}
            }
        };
        axum::serve(socket, router).with_graceful_shutdown(done).await?;
        Ok(self.is_member())
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown failed");
        }
        match std::fs::remove_file(self.layout.control_socket()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to remove the control socket"),
        }
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::control::ControlClient;

    async fn open(config: DaemonConfig) -> Node {
        Node::open(config, vec!["run".into()]).await.unwrap()
    }

    fn config(dir: &std::path::Path, name: &str, port: u16) -> DaemonConfig {
        DaemonConfig {
            name: name.to_string(),
            address: format!("127.0.0.1:{port}"),
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_creates_the_first_voter() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(config(dir.path(), "n1", 17443)).await;

        node.bootstrap().await.unwrap();

        let members = node.database.store().list_members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "n1");
        assert_eq!(members[0].role, Role::Voter);
        assert_eq!(members[0].schema_version, SCHEMA_VERSION);
        assert_eq!(node.trust.by_name("n1"), Some(node.local()));
        assert!(node.layout.is_member());

        // A second bootstrap leaves the cluster as it is.
        node.bootstrap().await.unwrap();
        assert_eq!(node.database.store().list_members().unwrap().len(), 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = config(dir.path(), "n1", 17444).layout();
        layout.create().unwrap();
        let first = CertKeyPair::load_or_generate(&layout.server_cert(), &layout.server_key(), || {
            generate_server_certificate("n1", "127.0.0.1:17444")
        })
        .unwrap();

        let node = open(config(dir.path(), "n1", 17444)).await;
        assert_eq!(node.local().certificate, first.cert_pem);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn member_without_state_waits_for_the_operator() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(open(config(dir.path(), "n1", 17445)).await);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(node.clone().serve(false, shutdown_rx));

        let client = ControlClient::new(node.layout.control_socket());
        let mut status = None;
        for _ in 0..100 {
            if node.layout.control_socket().exists() {
                status = Some(client.bootstrap().await.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let status = status.expect("control socket never appeared");
        assert_eq!(status.name, "n1");
        assert_eq!(status.trusted, 1);
        assert!(node.is_member());

        // The control socket is bound before the network listener.
        for _ in 0..100 {
            if tokio::net::TcpStream::connect("127.0.0.1:17445").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let err = client.join("127.0.0.1:1", "secret").await.unwrap_err();
        assert!(err.to_string().contains("already belongs"), "{err}");

        shutdown_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
        assert!(!node.layout.control_socket().exists());
    }

    #[tokio::test]
    async fn shutdown_while_waiting_keeps_no_cluster_state() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(open(config(dir.path(), "n1", 17447)).await);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(node.clone().serve(false, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
        assert!(!node.is_member());
    }

    #[test]
    fn restart_does_not_repeat_bootstrap() {
        let argv = ["/usr/bin/corrald", "--config", "/etc/corral/corrald.toml", "run", "--bootstrap"];
        let args = restart_args(argv.into_iter().map(OsString::from));
        let expected: Vec<OsString> = ["--config", "/etc/corral/corrald.toml", "run"]
            .into_iter()
            .map(OsString::from)
            .collect();
        assert_eq!(args, expected);

        let plain = restart_args(["corrald", "run"].into_iter().map(OsString::from));
        assert_eq!(plain, vec![OsString::from("run")]);
    }

    #[tokio::test]
    async fn failed_join_leaves_no_cluster_state() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(config(dir.path(), "n2", 17446)).await;

        assert!(node.join("127.0.0.1:1", "secret").await.is_err());
        assert!(!node.layout.is_member());
        assert_eq!(node.trust.count(), 0);
        node.shutdown().await;
    }
}
