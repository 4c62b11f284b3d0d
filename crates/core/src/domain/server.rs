//! JSON command dispatcher
//!
//! A command is a JSON object `{"method": ..., "system": ..., ...fields}`.
//! Global methods create and enumerate; every other method is scoped to one
//! live system (a [`Router`]) and runs under that router's lock. Replies are
//! either the method's payload or `{"error": ..., "data": ...}`.

use crate::domain::audio::{AudioError, Driver, DriverId};
use crate::domain::backend::AudioBackend;
use crate::domain::config::EarConfig;
use crate::domain::mixer::{Channel, ChannelId, ZoneId};
use crate::domain::router::Router;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier handed out by `create_system`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reasons a command is rejected
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("JSON payload required")]
    InvalidPayload,

    #[error("Missing system id")]
    MissingSessionId,

    #[error("Unknown system")]
    UnknownSession(Value),

    #[error("Unknown method")]
    UnknownMethod(Value),

    #[error("Unknown driver")]
    UnknownDriver(Value),

    #[error("Invalid params")]
    InvalidParams(String),

    #[error("Session limit reached")]
    SessionLimit(usize),

    #[error(transparent)]
    Domain(#[from] AudioError),
}

impl DispatchError {
    /// Stable error string sent to clients
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::InvalidPayload => "JSON payload required",
            DispatchError::MissingSessionId => "Missing system id",
            DispatchError::UnknownSession(_) => "Unknown system",
            DispatchError::UnknownMethod(_) => "Unknown method",
            DispatchError::UnknownDriver(_) => "Unknown driver",
            DispatchError::InvalidParams(_) => "Invalid params",
            DispatchError::SessionLimit(_) => "Session limit reached",
            DispatchError::Domain(e) => match e {
                AudioError::DimensionMismatch { .. } => "Dimension mismatch",
                AudioError::OutOfRange { .. } => "Out of range",
                AudioError::Cycle { .. } => "Zone cycle",
                AudioError::DuplicateChild { .. } => "Duplicate child",
                AudioError::NotFound(_) => "Not found",
                AudioError::AlreadyRunning => "Already running",
                AudioError::NotRunning => "Not running",
                AudioError::InvalidVolume(_) => "Invalid volume",
                AudioError::Backend(_) => "Backend failure",
            },
        }
    }

    /// Error record `{error, data?}`
    pub fn to_response(&self) -> Value {
        let data = match self {
            DispatchError::InvalidPayload | DispatchError::MissingSessionId => None,
            DispatchError::UnknownSession(id) => Some(id.clone()),
            DispatchError::UnknownMethod(method) => Some(method.clone()),
            DispatchError::UnknownDriver(id) => Some(id.clone()),
            DispatchError::InvalidParams(msg) => Some(json!(msg)),
            DispatchError::SessionLimit(max) => Some(json!(max)),
            DispatchError::Domain(e) => Some(json!(e.to_string())),
        };

        let mut record = Map::new();
        record.insert("error".to_string(), json!(self.label()));
        if let Some(data) = data {
            record.insert("data".to_string(), data);
        }
        Value::Object(record)
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Whether a method needs a `system` id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    System,
}

/// Every method the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    CreateSystem,
    ListDrivers,
    DestroySystem,
    Start,
    Stop,
    GetState,
    GetUsage,
    GetDriver,
    SetDriver,
    ListSpeakers,
    SetSpeakerVolume,
    SetSpeakerName,
    CreateZone,
    DestroyZone,
    AddZone,
    RemoveZone,
    SetZoneSpeakers,
    RenameZone,
    ListZones,
    CreateChannel,
    DestroyChannel,
    ListChannels,
    GetChannel,
    AttachZone,
    DetachZone,
    SetAttachmentVolume,
    RefreshChannel,
}

impl Method {
    pub const ALL: [Method; 27] = [
        Method::CreateSystem,
        Method::ListDrivers,
        Method::DestroySystem,
        Method::Start,
        Method::Stop,
        Method::GetState,
        Method::GetUsage,
        Method::GetDriver,
        Method::SetDriver,
        Method::ListSpeakers,
        Method::SetSpeakerVolume,
        Method::SetSpeakerName,
        Method::CreateZone,
        Method::DestroyZone,
        Method::AddZone,
        Method::RemoveZone,
        Method::SetZoneSpeakers,
        Method::RenameZone,
        Method::ListZones,
        Method::CreateChannel,
        Method::DestroyChannel,
        Method::ListChannels,
        Method::GetChannel,
        Method::AttachZone,
        Method::DetachZone,
        Method::SetAttachmentVolume,
        Method::RefreshChannel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::CreateSystem => "create_system",
            Method::ListDrivers => "list_drivers",
            Method::DestroySystem => "destroy_system",
            Method::Start => "start",
            Method::Stop => "stop",
            Method::GetState => "get_state",
            Method::GetUsage => "get_usage",
            Method::GetDriver => "get_driver",
            Method::SetDriver => "set_driver",
            Method::ListSpeakers => "list_speakers",
            Method::SetSpeakerVolume => "set_speaker_volume",
            Method::SetSpeakerName => "set_speaker_name",
            Method::CreateZone => "create_zone",
            Method::DestroyZone => "destroy_zone",
            Method::AddZone => "add_zone",
            Method::RemoveZone => "remove_zone",
            Method::SetZoneSpeakers => "set_zone_speakers",
            Method::RenameZone => "rename_zone",
            Method::ListZones => "list_zones",
            Method::CreateChannel => "create_channel",
            Method::DestroyChannel => "destroy_channel",
            Method::ListChannels => "list_channels",
            Method::GetChannel => "get_channel",
            Method::AttachZone => "attach_zone",
            Method::DetachZone => "detach_zone",
            Method::SetAttachmentVolume => "set_attachment_volume",
            Method::RefreshChannel => "refresh_channel",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn scope(self) -> Scope {
        match self {
            Method::CreateSystem | Method::ListDrivers => Scope::Global,
            _ => Scope::System,
        }
    }
}

// ----------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSystemParams {
    #[serde(default)]
    driver: Option<Value>,
    #[serde(default)]
    start: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DriverParams {
    #[serde(default)]
    driver: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SpeakerVolumeParams {
    speaker: usize,
    volume: f32,
}

#[derive(Debug, Deserialize)]
struct SpeakerNameParams {
    speaker: usize,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateZoneParams {
    name: String,
    #[serde(default)]
    speakers: Vec<usize>,
    #[serde(default)]
    parent: Option<ZoneId>,
}

#[derive(Debug, Deserialize)]
struct ZoneParams {
    zone: ZoneId,
}

#[derive(Debug, Deserialize)]
struct LinkParams {
    parent: ZoneId,
    child: ZoneId,
}

#[derive(Debug, Deserialize)]
struct RenameZoneParams {
    zone: ZoneId,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ZoneSpeakersParams {
    zone: ZoneId,
    speakers: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateChannelParams {
    #[serde(default)]
    name: Option<String>,
    channels: usize,
}

#[derive(Debug, Deserialize)]
struct ChannelParams {
    channel: ChannelId,
}

#[derive(Debug, Deserialize)]
struct AttachParams {
    channel: ChannelId,
    zone: ZoneId,
}

#[derive(Debug, Deserialize)]
struct AttachVolumeParams {
    channel: ChannelId,
    zone: ZoneId,
    volume: f32,
}

fn params<T: DeserializeOwned>(command: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(command.clone()))
        .map_err(|e| DispatchError::InvalidParams(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DispatchError::InvalidParams(e.to_string()))
}

// ----------------------------------------------------------------------
// Descriptors
// ----------------------------------------------------------------------

fn driver_info(driver: &Driver) -> Value {
    json!({
        "id": driver.id,
        "name": driver.name,
        "rate": driver.rate,
        "mode": driver.mode,
        "channels": driver.channels,
    })
}

fn zone_info(router: &Router, id: ZoneId) -> Result<Value> {
    let zone = router.zones().zone(id)?;
    Ok(json!({
        "id": zone.id,
        "name": zone.name,
        "parent": zone.parent,
        "children": zone.children,
        "speakers": zone.speakers,
        "resolved": router.resolve_zone(id)?,
    }))
}

fn channel_info(channel: &Channel) -> Value {
    json!({
        "id": channel.id,
        "name": channel.name,
        "channels": channel.sub_channels(),
        "zones": channel.zones(),
        "matrix": channel.matrix().rows(),
        "stale": channel.is_stale(),
    })
}

fn lock(router: &Mutex<Router>) -> MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------

type SharedRouter = Arc<Mutex<Router>>;

/// Session table plus the backend that feeds it
pub struct Server {
    backend: Arc<dyn AudioBackend>,
    config: EarConfig,
    sessions: RwLock<HashMap<SessionId, SharedRouter>>,
}

impl Server {
    pub fn new(backend: Arc<dyn AudioBackend>, config: EarConfig) -> Self {
        Self {
            backend,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EarConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Handle one raw command line and render the reply
    pub fn handle(&self, payload: &str) -> String {
        self.handle_bytes(payload.as_bytes())
    }

    /// Same as [`Server::handle`] for input that may not be UTF-8
    pub fn handle_bytes(&self, payload: &[u8]) -> String {
        let reply = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(command)) => self.dispatch(&command),
            _ => Err(DispatchError::InvalidPayload),
        };
        match reply {
            Ok(value) => value.to_string(),
            Err(e) => {
                debug!(error = %e, "Command rejected");
                e.to_response().to_string()
            }
        }
    }

    /// Route a parsed command to its handler
    pub fn dispatch(&self, command: &Map<String, Value>) -> Result<Value> {
        let name = command.get("method");
        let method = name
            .and_then(Value::as_str)
            .and_then(Method::parse)
            .ok_or_else(|| DispatchError::UnknownMethod(name.cloned().unwrap_or(Value::Null)))?;

        match method.scope() {
            Scope::Global => self.call_global(method, command),
            Scope::System => {
                let raw = match command.get("system") {
                    None | Some(Value::Null) => return Err(DispatchError::MissingSessionId),
                    Some(raw) => raw,
                };
                let id = raw
                    .as_str()
                    .and_then(SessionId::parse)
                    .ok_or_else(|| DispatchError::UnknownSession(raw.clone()))?;

                if method == Method::DestroySystem {
                    return self.destroy_system(id, raw);
                }

                let router = self
                    .router(id)
                    .ok_or_else(|| DispatchError::UnknownSession(raw.clone()))?;
                let mut router = lock(&router);
                self.call_scoped(method, &mut router, command)
            }
        }
    }

    /// Release every live session
    pub fn shutdown(&self) {
        let drained: Vec<(SessionId, SharedRouter)> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (id, router) in drained {
            if let Err(e) = lock(&router).release() {
                warn!(system = %id, error = %e, "Failed to release system");
            }
        }
        info!("All systems released");
    }

    fn router(&self, id: SessionId) -> Option<SharedRouter> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Anything that is not the id of a present driver is an unknown driver
    fn resolve_driver(&self, raw: Option<Value>) -> Result<Driver> {
        let raw = raw.unwrap_or(Value::Null);
        let id = match raw.as_str().and_then(DriverId::parse) {
            Some(id) => id,
            None => return Err(DispatchError::UnknownDriver(raw)),
        };
        self.backend
            .driver(&id)?
            .ok_or(DispatchError::UnknownDriver(raw))
    }

    fn call_global(&self, method: Method, command: &Map<String, Value>) -> Result<Value> {
        match method {
            Method::ListDrivers => {
                let drivers = self.backend.drivers()?;
                Ok(Value::Array(drivers.iter().map(driver_info).collect()))
            }
            Method::CreateSystem => self.create_system(params(command)?),
            _ => Err(DispatchError::UnknownMethod(json!(method.name()))),
        }
    }

    fn create_system(&self, p: CreateSystemParams) -> Result<Value> {
        let driver = self.resolve_driver(p.driver)?;
        if !self.config.allows_session(self.session_count()) {
            return Err(DispatchError::SessionLimit(self.config.sessions.max_sessions));
        }

        let mut router = Router::new(self.backend.create_session()?, driver)?;
        self.config.apply_zones(&mut router)?;
        if p.start.unwrap_or(self.config.sessions.auto_start) {
            router.start()?;
        }

        let id = SessionId::generate();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if !self.config.allows_session(sessions.len()) {
            return Err(DispatchError::SessionLimit(self.config.sessions.max_sessions));
        }
        info!(system = %id, driver = %router.driver().name, "System created");
        sessions.insert(id, Arc::new(Mutex::new(router)));
        Ok(json!({ "system": id }))
    }

    fn destroy_system(&self, id: SessionId, raw: &Value) -> Result<Value> {
        let router = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| DispatchError::UnknownSession(raw.clone()))?;

        lock(&router).release()?;
        info!(system = %id, "System destroyed");
        Ok(json!({ "system": id }))
    }

    fn call_scoped(
        &self,
        method: Method,
        router: &mut Router,
        command: &Map<String, Value>,
    ) -> Result<Value> {
        match method {
            Method::Start => {
                router.start()?;
                Ok(json!({ "state": router.state() }))
            }
            Method::Stop => {
                router.stop()?;
                Ok(json!({ "state": router.state() }))
            }
            Method::GetState => Ok(json!({
                "state": router.state(),
                "driver": driver_info(router.driver()),
                "speakers": router.num_speakers(),
            })),
            Method::GetUsage => to_json(&router.usage()?),
            Method::GetDriver => Ok(driver_info(router.driver())),
            Method::SetDriver => {
                let p: DriverParams = params(command)?;
                let driver = self.resolve_driver(p.driver)?;
                router.set_driver(driver)?;
                Ok(driver_info(router.driver()))
            }

            Method::ListSpeakers => to_json(&router.speakers().iter().collect::<Vec<_>>()),
            Method::SetSpeakerVolume => {
                let p: SpeakerVolumeParams = params(command)?;
                let recomputed = router.set_speaker_volume(p.speaker, p.volume)?;
                Ok(json!({ "recomputed": recomputed }))
            }
            Method::SetSpeakerName => {
                let p: SpeakerNameParams = params(command)?;
                router.set_speaker_name(p.speaker, p.name)?;
                to_json(&router.speakers().get(p.speaker))
            }

            Method::CreateZone => {
                let p: CreateZoneParams = params(command)?;
                let id = match p.parent {
                    Some(parent) => router.create_zone_in(parent, &p.name, p.speakers)?,
                    None => router.create_zone(&p.name, p.speakers)?,
                };
                zone_info(router, id)
            }
            Method::DestroyZone => {
                let p: ZoneParams = params(command)?;
                let detached = router.destroy_zone(p.zone)?;
                Ok(json!({ "zone": p.zone, "detached": detached }))
            }
            Method::AddZone => {
                let p: LinkParams = params(command)?;
                router.add_zone(p.parent, p.child)?;
                zone_info(router, p.child)
            }
            Method::RemoveZone => {
                let p: LinkParams = params(command)?;
                router.remove_zone(p.parent, p.child)?;
                zone_info(router, p.child)
            }
            Method::SetZoneSpeakers => {
                let p: ZoneSpeakersParams = params(command)?;
                router.set_zone_speakers(p.zone, p.speakers)?;
                zone_info(router, p.zone)
            }
            Method::RenameZone => {
                let p: RenameZoneParams = params(command)?;
                router.rename_zone(p.zone, &p.name)?;
                zone_info(router, p.zone)
            }
            Method::ListZones => {
                let ids: Vec<ZoneId> = router.zones().iter().map(|z| z.id).collect();
                let zones = ids
                    .into_iter()
                    .map(|id| zone_info(router, id))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(zones))
            }

            Method::CreateChannel => {
                let p: CreateChannelParams = params(command)?;
                let name = p.name.unwrap_or_else(|| format!("channel-{}", router.channels().count() + 1));
                let id = router.create_channel(&name, p.channels)?;
                Ok(channel_info(router.channel(id)?))
            }
            Method::DestroyChannel => {
                let p: ChannelParams = params(command)?;
                router.destroy_channel(p.channel)?;
                Ok(json!({ "channel": p.channel }))
            }
            Method::ListChannels => Ok(Value::Array(router.channels().map(channel_info).collect())),
            Method::GetChannel => {
                let p: ChannelParams = params(command)?;
                Ok(channel_info(router.channel(p.channel)?))
            }
            Method::AttachZone => {
                let p: AttachParams = params(command)?;
                to_json(&router.attach_zone(p.channel, p.zone)?)
            }
            Method::DetachZone => {
                let p: AttachParams = params(command)?;
                to_json(&router.detach_zone(p.channel, p.zone)?)
            }
            Method::SetAttachmentVolume => {
                let p: AttachVolumeParams = params(command)?;
                router.set_attachment_volume(p.channel, p.zone, p.volume)?;
                Ok(channel_info(router.channel(p.channel)?))
            }
            Method::RefreshChannel => {
                let p: ChannelParams = params(command)?;
                router.refresh_channel(p.channel)?;
                Ok(channel_info(router.channel(p.channel)?))
            }

            Method::CreateSystem | Method::ListDrivers | Method::DestroySystem => {
                Err(DispatchError::UnknownMethod(json!(method.name())))
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.session_count() > 0 {
            self.shutdown();
        }
    }
}
