//! Transport lifecycle coordination.
//!
//! The [`TransportManager`] owns at most one primary transport, chosen by
//! [`TransportMode`], and in `Http` mode an optional websocket hub companion
//! that carries pushes. It starts them in order, rolls back on failure and
//! aggregates their state into one report.
//!
//! Transports are built through [`TransportFactories`], so the manager never
//! knows about configuration and tests can inject mocks.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{bail, Result};

use super::{TransportClient, TransportError, TransportMode, TransportState};

/// Builds a transport, or `None` when that transport is not available.
pub type TransportFactory =
    Arc<dyn Fn() -> Result<Option<Arc<dyn TransportClient>>> + Send + Sync>;

/// One factory per transport variant.
#[derive(Clone)]
pub struct TransportFactories {
    http: TransportFactory,
    hub: TransportFactory,
    stdio: TransportFactory,
}

impl std::fmt::Debug for TransportFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactories").finish_non_exhaustive()
    }
}

impl TransportFactories {
    /// Start building a factory set.
    pub fn builder() -> TransportFactoriesBuilder {
        TransportFactoriesBuilder::default()
    }

    /// Factory for the primary transport of `mode`.
    fn primary_for(&self, mode: TransportMode) -> &TransportFactory {
        match mode {
            TransportMode::Http => &self.http,
            TransportMode::HttpPush => &self.hub,
            TransportMode::Stdio => &self.stdio,
        }
    }
}

/// Builder for [`TransportFactories`]. Every factory is required.
#[derive(Default)]
pub struct TransportFactoriesBuilder {
    http: Option<TransportFactory>,
    hub: Option<TransportFactory>,
    stdio: Option<TransportFactory>,
}

impl std::fmt::Debug for TransportFactoriesBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactoriesBuilder")
            .field("http", &self.http.is_some())
            .field("hub", &self.hub.is_some())
            .field("stdio", &self.stdio.is_some())
            .finish()
    }
}

impl TransportFactoriesBuilder {
    /// Set the plain HTTP factory.
    pub fn http<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Option<Arc<dyn TransportClient>>> + Send + Sync + 'static,
    {
        self.http = Some(Arc::new(factory));
        self
    }

    /// Set the websocket hub factory (primary in `HttpPush`, companion in `Http`).
    pub fn hub<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Option<Arc<dyn TransportClient>>> + Send + Sync + 'static,
    {
        self.hub = Some(Arc::new(factory));
        self
    }

    /// Set the stdio bridge factory.
    pub fn stdio<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Option<Arc<dyn TransportClient>>> + Send + Sync + 'static,
    {
        self.stdio = Some(Arc::new(factory));
        self
    }

    /// Finish the set.
    ///
    /// # Errors
    ///
    /// Fails if any factory is missing.
    pub fn build(self) -> Result<TransportFactories> {
        let missing: Vec<&str> = [
            ("http", self.http.is_none()),
            ("hub", self.hub.is_none()),
            ("stdio", self.stdio.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect();

        match (self.http, self.hub, self.stdio) {
            (Some(http), Some(hub), Some(stdio)) => Ok(TransportFactories { http, hub, stdio }),
            _ => bail!("missing transport factories: {}", missing.join(", ")),
        }
    }
}

/// The live transports of one successful `start`.
#[derive(Clone)]
struct ActiveSession {
    primary: Arc<dyn TransportClient>,
    companion: Option<Arc<dyn TransportClient>>,
    mode: TransportMode,
}

/// Process-wide manager installed by [`TransportManager::configure`].
static GLOBAL: RwLock<Option<Arc<TransportManager>>> = RwLock::new(None);

/// Coordinates the primary transport and its optional companion.
pub struct TransportManager {
    factories: TransportFactories,
    /// Serializes start/stop so a new primary never overlaps the old one.
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    requested_mode: Mutex<Option<TransportMode>>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("active_mode", &self.active_mode())
            .field("has_companion", &self.has_companion())
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Create a manager with nothing running.
    pub fn new(factories: TransportFactories) -> Self {
        Self {
            factories,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            requested_mode: Mutex::new(None),
        }
    }

    /// Install the process-wide manager, replacing any previous one.
    ///
    /// Call [`reset`](Self::reset) first to stop a previous manager's
    /// transports.
    pub fn configure(factories: TransportFactories) -> Arc<Self> {
        let manager = Arc::new(Self::new(factories));
        let previous = GLOBAL
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&manager));
        if previous.is_some_and(|m| m.has_active_transport()) {
            log::warn!("[Transport] Replaced a global manager that still had live transports");
        }
        manager
    }

    /// The process-wide manager, if configured.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop and remove the process-wide manager.
    pub async fn reset() {
        let previous = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(manager) = previous {
            manager.stop().await;
        }
    }

    fn snapshot(&self) -> Option<ActiveSession> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Mode of the running transports, if any.
    pub fn active_mode(&self) -> Option<TransportMode> {
        self.snapshot().map(|s| s.mode)
    }

    /// Whether a primary transport is running.
    pub fn has_active_transport(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Whether a companion transport is running.
    pub fn has_companion(&self) -> bool {
        self.snapshot().is_some_and(|s| s.companion.is_some())
    }

    /// Stop whatever runs, then start the transports for `mode`.
    ///
    /// Returns `false` if the primary cannot be built or started, or if a
    /// companion was built but failed to start. Nothing is left running on
    /// failure.
    pub async fn start(&self, mode: TransportMode) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        self.stop_active().await;
        *self.requested_mode.lock().unwrap_or_else(PoisonError::into_inner) = Some(mode);

        let primary = match (self.factories.primary_for(mode))() {
            Ok(Some(primary)) => primary,
            Ok(None) => {
                log::warn!("[Transport] No {} transport available", mode);
                return false;
            }
            Err(e) => {
                log::warn!("[Transport] Failed to create {} transport: {e:#}", mode);
                return false;
            }
        };

        let companion = if mode.wants_companion() {
            match (self.factories.hub)() {
                Ok(Some(companion)) => Some(companion),
                Ok(None) => {
                    log::warn!("[Transport] No websocket companion; continuing without push channel");
                    None
                }
                Err(e) => {
                    log::warn!("[Transport] Failed to create websocket companion, continuing without push channel: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        if !start_contained(Arc::clone(&primary)).await {
            log::warn!("[Transport] {} transport failed to start", primary.name());
            stop_contained(Arc::clone(&primary)).await;
            return false;
        }

        if let Some(companion) = &companion {
            if !start_contained(Arc::clone(companion)).await {
                log::warn!(
                    "[Transport] Companion {} failed to start; stopping {}",
                    companion.name(),
                    primary.name()
                );
                stop_contained(Arc::clone(companion)).await;
                stop_contained(Arc::clone(&primary)).await;
                return false;
            }
        }

        log::info!(
            "[Transport] Started {} mode ({}{})",
            mode,
            primary.name(),
            companion.as_ref().map(|c| format!(" + {}", c.name())).unwrap_or_default()
        );

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveSession {
            primary,
            companion,
            mode,
        });
        true
    }

    /// Stop the primary and companion. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_active().await;
    }

    /// Clear the active session first, then stop each transport on its own.
    async fn stop_active(&self) {
        let session = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(session) = session else { return };

        stop_contained(session.primary).await;
        if let Some(companion) = session.companion {
            stop_contained(companion).await;
        }
    }

    /// Liveness of the primary and, if present, the companion.
    pub async fn verify(&self) -> bool {
        let Some(session) = self.snapshot() else {
            return false;
        };
        if !verify_contained(session.primary).await {
            return false;
        }
        match session.companion {
            Some(companion) => verify_contained(companion).await,
            None => true,
        }
    }

    /// Aggregated state of the running transports.
    pub fn state(&self) -> TransportState {
        let Some(session) = self.snapshot() else {
            let name = self
                .requested_mode
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map_or("none", TransportMode::as_str);
            return TransportState::disconnected(name, None);
        };

        let primary = session.primary.state();
        match &session.companion {
            None => primary,
            Some(companion) => combine_states(&primary, &companion.state()),
        }
    }

    /// Send a command through the primary transport.
    ///
    /// # Errors
    ///
    /// `TransportError::InvalidOperation` when nothing is running, otherwise
    /// whatever the primary reports.
    pub async fn send_command(&self, command_json: &str) -> Result<String, TransportError> {
        let session = self
            .snapshot()
            .ok_or_else(|| TransportError::InvalidOperation("no active transport".into()))?;
        session.primary.send_command(command_json).await
    }
}

/// Stop a transport in its own task so a panic cannot escape.
async fn stop_contained(transport: Arc<dyn TransportClient>) {
    let name = transport.name().to_string();
    if let Err(e) = tokio::spawn(async move { transport.stop().await }).await {
        log::error!("[Transport] Stopping {} failed: {}", name, e);
    }
}

/// Start a transport in its own task; a panic counts as a failed start.
async fn start_contained(transport: Arc<dyn TransportClient>) -> bool {
    let name = transport.name().to_string();
    match tokio::spawn(async move { transport.start().await }).await {
        Ok(started) => started,
        Err(e) => {
            log::error!("[Transport] Starting {} failed: {}", name, e);
            false
        }
    }
}

/// Verify a transport in its own task; a panic counts as not alive.
async fn verify_contained(transport: Arc<dyn TransportClient>) -> bool {
    let name = transport.name().to_string();
    match tokio::spawn(async move { transport.verify().await }).await {
        Ok(alive) => alive,
        Err(e) => {
            log::error!("[Transport] Verifying {} failed: {}", name, e);
            false
        }
    }
}

/// Merge primary and companion reports into one.
fn combine_states(primary: &TransportState, companion: &TransportState) -> TransportState {
    let name = format!("{}+{}", primary.transport_name(), companion.transport_name());
    let session_id = companion
        .session_id()
        .or(primary.session_id())
        .map(str::to_string);

    let details: Vec<&str> = [primary.details(), companion.details()]
        .into_iter()
        .flatten()
        .filter(|d| !d.is_empty())
        .collect();
    let details = (!details.is_empty()).then(|| details.join(" | "));

    let state = if primary.is_connected() && companion.is_connected() {
        TransportState::connected(name)
    } else {
        let error = companion
            .error()
            .or(primary.error())
            .map_or_else(|| "transport disconnected".to_string(), str::to_string);
        TransportState::disconnected(name, Some(error))
    };

    state
        .with_port(primary.port())
        .with_session_id(session_id)
        .with_details(details)
}
