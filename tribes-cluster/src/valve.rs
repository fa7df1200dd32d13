use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;
use tracing::debug;
use typed_builder::TypedBuilder;

use tribes_core::ext::current_millis;

use crate::cluster::SimpleTcpCluster;
use crate::manager::ClusterManager;

/// Next stage of request processing.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn invoke(&self, request: &mut ClusterRequest) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct CrossContextSession {
    pub manager: Arc<dyn ClusterManager>,
    pub session_id: String,
}

/// The parts of a request the replication valve looks at. Sessions of other contexts touched
/// while the request runs are collected here and consumed when it completes.
#[derive(TypedBuilder)]
pub struct ClusterRequest {
    #[builder(setter(into))]
    pub uri: String,
    #[builder(default, setter(strip_option))]
    pub manager: Option<Arc<dyn ClusterManager>>,
    #[builder(default, setter(strip_option, into))]
    pub session_id: Option<String>,
    #[builder(default)]
    pub cross_context: bool,
    #[builder(default)]
    pub attributes: HashMap<String, String>,
    #[builder(default, setter(skip))]
    cross_context_sessions: Option<Vec<CrossContextSession>>,
}

impl ClusterRequest {
    /// Records a session of another context, ignored unless the request is cross-context.
    pub fn register_cross_context_session(&mut self, manager: Arc<dyn ClusterManager>, session_id: impl Into<String>) {
        let session_id = session_id.into();
        if let Some(sessions) = self.cross_context_sessions.as_mut() {
            let known = sessions
                .iter()
                .any(|s| s.session_id == session_id && Arc::ptr_eq(&s.manager, &manager));
            if !known {
                sessions.push(CrossContextSession { manager, session_id });
            }
        }
    }

    pub fn cross_context_sessions(&self) -> Option<&[CrossContextSession]> {
        self.cross_context_sessions.as_deref()
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ValveStatsSnapshot {
    pub requests: u64,
    pub send_requests: u64,
    pub cross_context_send_requests: u64,
    pub filter_requests: u64,
    pub failed_sends: u64,
    pub total_request_time_ms: u64,
    pub total_send_time_ms: u64,
    pub last_send_time: i64,
}

#[derive(Debug, Default)]
struct ValveStats {
    requests: AtomicU64,
    send_requests: AtomicU64,
    cross_context_send_requests: AtomicU64,
    filter_requests: AtomicU64,
    failed_sends: AtomicU64,
    total_request_time_ms: AtomicU64,
    total_send_time_ms: AtomicU64,
    last_send_time: AtomicI64,
}

impl ValveStats {
    fn update(&self, request_started: Instant, send_started: Instant) {
        let now = Instant::now();
        let request_time = now.duration_since(request_started).as_millis() as u64;
        let send_time = now.duration_since(send_started).as_millis() as u64;
        self.last_send_time.store(current_millis(), Ordering::Relaxed);
        let total_request = self.total_request_time_ms.fetch_add(request_time, Ordering::Relaxed) + request_time;
        let total_send = self.total_send_time_ms.fetch_add(send_time, Ordering::Relaxed) + send_time;
        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if requests % 100 == 0 {
            debug!(
                "average request time {} ms, average send time {} ms, requests {}, send requests {}, cross context send requests {}, filtered requests {}",
                total_request / requests,
                total_send / requests,
                requests,
                self.send_requests.load(Ordering::Relaxed),
                self.cross_context_send_requests.load(Ordering::Relaxed),
                self.filter_requests.load(Ordering::Relaxed),
            );
        }
    }

    fn snapshot(&self) -> ValveStatsSnapshot {
        ValveStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            send_requests: self.send_requests.load(Ordering::Relaxed),
            cross_context_send_requests: self.cross_context_send_requests.load(Ordering::Relaxed),
            filter_requests: self.filter_requests.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            total_request_time_ms: self.total_request_time_ms.load(Ordering::Relaxed),
            total_send_time_ms: self.total_send_time_ms.load(Ordering::Relaxed),
            last_send_time: self.last_send_time.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.requests,
            &self.send_requests,
            &self.cross_context_send_requests,
            &self.filter_requests,
            &self.failed_sends,
            &self.total_request_time_ms,
            &self.total_send_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_send_time.store(0, Ordering::Relaxed);
    }
}

/// Replicates session changes once the rest of the request pipeline finished.
pub struct ReplicationValve {
    cluster: Arc<SimpleTcpCluster>,
    next: Arc<dyn RequestHandler>,
    filter: Option<Regex>,
    primary_indicator: bool,
    primary_indicator_name: String,
    statistics: bool,
    stats: ValveStats,
}

impl ReplicationValve {
    pub fn new(cluster: Arc<SimpleTcpCluster>, next: Arc<dyn RequestHandler>) -> anyhow::Result<Self> {
        let valve = cluster.config().valve.clone();
        let filter = if valve.filter.is_empty() {
            None
        } else {
            Some(Regex::new(&valve.filter)?)
        };
        Ok(Self {
            cluster,
            next,
            filter,
            primary_indicator: valve.primary_indicator,
            primary_indicator_name: valve.primary_indicator_name,
            statistics: valve.statistics,
            stats: ValveStats::default(),
        })
    }

    pub fn statistics(&self) -> ValveStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn is_request_without_session_change(&self, uri: &str) -> bool {
        self.filter.as_ref().map_or(false, |filter| filter.is_match(uri))
    }

    fn create_primary_indicator(&self, request: &mut ClusterRequest) {
        let primary = match (&request.manager, &request.session_id) {
            (Some(manager), Some(session_id)) => manager.is_primary_session(session_id),
            _ => None,
        };
        if let Some(primary) = primary {
            request.attributes.insert(self.primary_indicator_name.clone(), primary.to_string());
        }
    }

    async fn invoke_and_replicate(&self, request: &mut ClusterRequest, started: Instant) -> anyhow::Result<()> {
        self.next.invoke(request).await?;
        let manager = match &request.manager {
            Some(manager) => manager.clone(),
            None => return Ok(()),
        };
        // another cluster owns this manager
        if !self.cluster.has_manager(manager.name()) {
            return Ok(());
        }
        if self.cluster.has_members() {
            self.send_replication_message(request, &manager, started).await;
        } else {
            self.reset_replication_request(request, &manager);
        }
        Ok(())
    }

    async fn send_replication_message(&self, request: &mut ClusterRequest, manager: &Arc<dyn ClusterManager>, started: Instant) {
        let send_started = Instant::now();
        self.send_invalid_sessions(manager).await;
        self.send_session_replication_message(request, manager).await;
        if let Some(sessions) = request.cross_context_sessions.take() {
            self.send_cross_context_sessions(sessions).await;
        }
        if self.statistics {
            self.stats.update(started, send_started);
        }
    }

    async fn send_invalid_sessions(&self, manager: &Arc<dyn ClusterManager>) {
        for session_id in manager.invalidated_sessions() {
            self.send(manager, &session_id).await;
        }
    }

    async fn send_session_replication_message(&self, request: &ClusterRequest, manager: &Arc<dyn ClusterManager>) {
        let session_id = match &request.session_id {
            Some(session_id) => session_id,
            None => return,
        };
        if self.is_request_without_session_change(&request.uri) {
            if self.statistics {
                self.stats.filter_requests.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        if self.send(manager, session_id).await && self.statistics {
            self.stats.send_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn send_cross_context_sessions(&self, sessions: Vec<CrossContextSession>) {
        for session in sessions {
            if !self.cluster.has_manager(session.manager.name()) {
                continue;
            }
            if self.send(&session.manager, &session.session_id).await && self.statistics {
                self.stats.cross_context_send_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns true when the manager had something to replicate.
    async fn send(&self, manager: &Arc<dyn ClusterManager>, session_id: &str) -> bool {
        match manager.request_completed(session_id) {
            Some(message) => {
                if self.cluster.send(message).await.is_err() {
                    self.stats.failed_sends.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Nobody to replicate to: drop the change logs so they do not grow without bound.
    fn reset_replication_request(&self, request: &mut ClusterRequest, manager: &Arc<dyn ClusterManager>) {
        manager.reset_invalidated();
        if let Some(session_id) = &request.session_id {
            manager.reset_delta_request(session_id);
            manager.set_primary_session(session_id, true);
        }
        for session in request.cross_context_sessions.take().unwrap_or_default() {
            session.manager.reset_invalidated();
            session.manager.reset_delta_request(&session.session_id);
            session.manager.set_primary_session(&session.session_id, true);
        }
    }
}

#[async_trait]
impl RequestHandler for ReplicationValve {
    async fn invoke(&self, request: &mut ClusterRequest) -> anyhow::Result<()> {
        let started = Instant::now();
        if self.primary_indicator {
            self.create_primary_indicator(request);
        }
        if request.cross_context {
            request.cross_context_sessions = Some(Vec::new());
        }
        let result = self.invoke_and_replicate(request, started).await;
        request.cross_context_sessions = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use config::{File, FileFormat};

    use tribes_core::config::ConfigBuilder;

    use crate::cluster::tests::transport;
    use crate::cluster::SimpleTcpCluster;
    use crate::config::ClusterConfig;
    use crate::listener::ClusterSessionListener;
    use crate::manager::{ClusterManager, DeltaManager};
    use crate::valve::{ClusterRequest, ReplicationValve, RequestHandler};

    const VALVE_CONFIG: &str = r#"
        channel_send_options = "use_ack|sync_ack"
        [valve]
        filter = ".*\\.(gif|css)$"
        primary_indicator = true
        statistics = true
    "#;

    struct TouchSessions {
        manager: Arc<DeltaManager>,
        cross: Option<(Arc<DeltaManager>, String)>,
    }

    #[async_trait]
    impl RequestHandler for TouchSessions {
        async fn invoke(&self, request: &mut ClusterRequest) -> anyhow::Result<()> {
            if let Some(session_id) = request.session_id.clone() {
                self.manager.set_attribute(&session_id, "hits", vec![1])?;
            }
            if let Some((manager, session_id)) = &self.cross {
                manager.set_attribute(session_id, "shared", vec![2])?;
                request.register_cross_context_session(manager.clone(), session_id.clone());
            }
            Ok(())
        }
    }

    fn config() -> anyhow::Result<ClusterConfig> {
        ClusterConfig::builder()
            .add_source(File::from_str(VALVE_CONFIG, FileFormat::Toml))?
            .build()
    }

    #[tokio::test]
    async fn test_discard_without_members() -> anyhow::Result<()> {
        let cluster = SimpleTcpCluster::new(config()?, transport()?)?;
        let manager = Arc::new(DeltaManager::new(cluster.manager_name("/app")));
        let other = Arc::new(DeltaManager::new(cluster.manager_name("/other")));
        cluster.register_manager(manager.clone())?;
        cluster.register_manager(other.clone())?;
        let id = manager.create_session("S1");
        let other_id = other.create_session("S2");
        manager.set_primary_session(&id, false);
        other.set_primary_session(&other_id, false);
        let handler = TouchSessions { manager: manager.clone(), cross: Some((other.clone(), other_id.clone())) };
        let valve = ReplicationValve::new(cluster.clone(), Arc::new(handler))?;
        let mut request = ClusterRequest::builder()
            .uri("/app/index.html")
            .manager(manager.clone() as Arc<dyn ClusterManager>)
            .session_id(id.clone())
            .cross_context(true)
            .build();
        valve.invoke(&mut request).await?;
        assert_eq!(manager.pending_delta_len(&id), 0);
        assert_eq!(other.pending_delta_len(&other_id), 0);
        assert_eq!(manager.attribute(&id, "hits"), Some(vec![1]));
        assert_eq!(manager.is_primary_session(&id), Some(true));
        assert_eq!(other.is_primary_session(&other_id), Some(true));
        assert!(request.cross_context_sessions().is_none());
        assert_eq!(request.attributes.get("org.apache.catalina.ha.tcp.isPrimarySession").map(String::as_str), Some("false"));
        let stats = valve.statistics();
        assert_eq!(stats.send_requests, 0);
        assert_eq!(stats.requests, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidated_discarded_without_members() -> anyhow::Result<()> {
        let cluster = SimpleTcpCluster::new(config()?, transport()?)?;
        let manager = Arc::new(DeltaManager::new(cluster.manager_name("/app")));
        cluster.register_manager(manager.clone())?;
        let handler = TouchSessions { manager: manager.clone(), cross: None };
        let valve = ReplicationValve::new(cluster.clone(), Arc::new(handler))?;
        for i in 0..1000 {
            let id = manager.create_session(format!("S{}", i));
            let mut request = ClusterRequest::builder()
                .uri("/app/logout")
                .manager(manager.clone() as Arc<dyn ClusterManager>)
                .session_id(id.clone())
                .build();
            valve.invoke(&mut request).await?;
            manager.invalidate(&id);
        }
        let mut request = ClusterRequest::builder()
            .uri("/app/index.html")
            .manager(manager.clone() as Arc<dyn ClusterManager>)
            .build();
        valve.invoke(&mut request).await?;
        assert!(manager.invalidated_sessions().is_empty());
        assert_eq!(manager.session_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_replicate_after_request() -> anyhow::Result<()> {
        let first = SimpleTcpCluster::new(config()?, transport()?)?;
        let second = SimpleTcpCluster::new(config()?, transport()?)?;
        first.start().await?;
        let second_member = second.start().await?;
        first.add_member(second_member);
        let source = Arc::new(DeltaManager::new(first.manager_name("/app")));
        let replica = Arc::new(DeltaManager::new(second.manager_name("/app")));
        first.register_manager(source.clone())?;
        second.register_manager(replica.clone())?;
        second.add_cluster_listener(Arc::new(ClusterSessionListener));
        let handler = TouchSessions { manager: source.clone(), cross: None };
        let valve = ReplicationValve::new(first.clone(), Arc::new(handler))?;

        let id = source.create_session("S1");
        let mut request = ClusterRequest::builder()
            .uri("/app/cart")
            .manager(source.clone() as Arc<dyn ClusterManager>)
            .session_id(id.clone())
            .build();
        valve.invoke(&mut request).await?;
        assert_eq!(replica.attribute(&id, "hits"), Some(vec![1]));
        assert_eq!(source.pending_delta_len(&id), 0);

        let mut request = ClusterRequest::builder()
            .uri("/app/logo.gif")
            .manager(source.clone() as Arc<dyn ClusterManager>)
            .session_id(id.clone())
            .build();
        valve.invoke(&mut request).await?;
        assert_eq!(source.pending_delta_len(&id), 1);

        let doomed = source.create_session("S3");
        source.set_attribute(&doomed, "a", vec![3])?;
        let mut request = ClusterRequest::builder()
            .uri("/app/cart")
            .manager(source.clone() as Arc<dyn ClusterManager>)
            .session_id(doomed.clone())
            .build();
        valve.invoke(&mut request).await?;
        assert!(replica.attribute(&doomed, "a").is_some());
        source.invalidate(&doomed);
        let mut request = ClusterRequest::builder()
            .uri("/app/logout.css")
            .manager(source.clone() as Arc<dyn ClusterManager>)
            .build();
        valve.invoke(&mut request).await?;
        assert!(replica.session(&doomed).is_none());

        let stats = valve.statistics();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.send_requests, 2);
        assert_eq!(stats.filter_requests, 1);
        assert_eq!(stats.failed_sends, 0);
        valve.reset_statistics();
        assert_eq!(valve.statistics().requests, 0);
        first.stop().await;
        second.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_manager_untouched() -> anyhow::Result<()> {
        let cluster = SimpleTcpCluster::new(config()?, transport()?)?;
        let foreign = Arc::new(DeltaManager::new("elsewhere#/app"));
        let id = foreign.create_session("S1");
        let handler = TouchSessions { manager: foreign.clone(), cross: None };
        let valve = ReplicationValve::new(cluster, Arc::new(handler))?;
        let mut request = ClusterRequest::builder()
            .uri("/app")
            .manager(foreign.clone() as Arc<dyn ClusterManager>)
            .session_id(id.clone())
            .build();
        valve.invoke(&mut request).await?;
        assert_eq!(foreign.pending_delta_len(&id), 1);
        let mut missing = ClusterRequest::builder().uri("/none").session_id("S404").build();
        assert!(valve.invoke(&mut missing).await.is_err());
        Ok(())
    }
}
