//! Session lifecycle state machine: startup, readiness gating, room
//! switching, reconnection, and stealth mode. Also owns the per-frame
//! inbound pipeline: draining the router's two queues into NV merges,
//! device-mapping resolution, RPC delivery, and per-peer pose channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::applier::{AvatarPose, AvatarTransformApplier, SmoothingSettings};
use crate::clock::{dynamic_buffer_multiplier, BufferMultiplierSettings, SendIntervalEstimator, TimeEstimator};
use crate::codec;
use crate::config::SessionConfig;
use crate::io_core::{IoCoreHandle, Transport};
use crate::netvars::{NvStore, VarRecord};
use crate::router::{MessageRouter, RouterEvent, SessionEvent as RouterSessionEvent};
use crate::rpc::RpcChannel;
use crate::types::ClientTransform;
use crate::wire;

/// Observable events surfaced to the embedding application, drained one at
/// a time with [`SessionController::drain_event`].
#[derive(Debug, Clone)]
pub enum NetSyncEvent {
    AvatarConnected(u16),
    AvatarDisconnected(u16),
    RpcReceived { sender_client_no: u16, name: String, args: Vec<serde_json::Value> },
    GlobalVariableChanged { name: String, old: Option<String>, new: String },
    ClientVariableChanged { client_no: u16, name: String, old: Option<String>, new: String },
    Ready,
    ConnectionError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    Reconnecting,
    TearingDown,
}

pub enum LocalMode {
    Visible(Box<dyn Fn() -> ClientTransform + Send>),
    Stealth,
}

pub struct SessionController {
    config: SessionConfig,
    device_id: String,
    state: SessionState,
    client_no: u16,
    mode: LocalMode,
    room_switch_in_progress: bool,
    ready_fired: bool,
    connected_at: Option<f64>,
    io: Option<IoCoreHandle>,
    pub router: Arc<MessageRouter>,
    pub nv: NvStore,
    pub rpc: RpcChannel,
    peers: HashMap<u16, AvatarTransformApplier>,
    smoothing: SmoothingSettings,
    time_estimator: TimeEstimator,
    send_interval: SendIntervalEstimator,
    buffer_settings: BufferMultiplierSettings,
    events: VecDeque<NetSyncEvent>,
}

const INITIAL_SYNC_GRACE_SECS: f64 = 2.0;

impl SessionController {
    pub fn new(config: SessionConfig, device_id: impl Into<String>, mode: LocalMode) -> Self {
        let rpc_settings = crate::rpc::RpcSettings {
            rate_limit: config.rpc_limit,
            rate_window_secs: config.rpc_rate_window_secs,
            pending_cap: config.rpc_pending_max,
            ttl_secs: config.rpc_ttl_secs,
            flush_per_frame: config.rpc_flush_per_frame,
        };
        let nominal_interval = 1.0 / config.send_rate_hz.max(0.1);
        Self {
            config,
            device_id: device_id.into(),
            state: SessionState::Idle,
            client_no: 0,
            mode,
            room_switch_in_progress: false,
            ready_fired: false,
            connected_at: None,
            io: None,
            router: Arc::new(MessageRouter::new()),
            nv: NvStore::new(),
            rpc: RpcChannel::new(rpc_settings),
            peers: HashMap::new(),
            smoothing: SmoothingSettings::default(),
            time_estimator: TimeEstimator::new(),
            send_interval: SendIntervalEstimator::new(nominal_interval),
            buffer_settings: BufferMultiplierSettings::default(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_no(&self) -> u16 {
        self.client_no
    }

    pub fn is_stealth(&self) -> bool {
        matches!(self.mode, LocalMode::Stealth)
    }

    pub fn is_ready(&self) -> bool {
        self.client_no > 0 && self.nv.is_ready()
    }

    /// Called once a transport is established (after discovery, if any).
    /// Spawns the I/O core and moves to `Connected`.
    pub fn attach_transport<T: Transport + 'static>(&mut self, transport: T, now_seconds: impl Fn() -> f64 + Send + 'static) {
        self.state = SessionState::Connected;
        self.connected_at = Some(now_seconds());
        let handle = crate::io_core::spawn(transport, self.config.room_id.clone(), Arc::clone(&self.router) as Arc<dyn crate::router::RouterSink>, now_seconds);
        self.io = Some(handle);
        self.state = SessionState::Handshaking;
    }

    /// Sends the one handshake frame appropriate to this session's mode
    /// (normal pose or stealth), per the room-switch / startup contract.
    pub fn send_handshake(&self) {
        let Some(io) = &self.io else { return };
        let transform = match &self.mode {
            LocalMode::Stealth => ClientTransform::stealth(self.device_id.clone()),
            LocalMode::Visible(f) => f(),
        };
        if let Ok(encoded) = codec::encode_client_pose(&transform) {
            io.offer_control(encoded);
        }
    }

    /// Resolves this session's own `client_no` from an inbound device
    /// mapping frame, and forwards the frame to the router.
    pub fn on_device_mapping(&mut self, frame: crate::wire::DeviceIdMappingFrame) -> (Vec<crate::router::SessionEvent>, Vec<(u16, crate::types::RoomClientEntry)>) {
        if let Some((entry, _)) = frame.entries.iter().find(|(_, id)| id == &self.device_id) {
            self.client_no = entry.client_no;
            self.router.set_local_client_no(self.client_no);
        }
        self.router.apply_device_mapping(frame)
    }

    /// Notes that an initial NV sync frame arrived, satisfying the
    /// readiness gate early.
    pub fn on_initial_nv_sync(&mut self) {
        self.nv.mark_initial_sync_done();
    }

    /// Drives the readiness gate forward on timeout, independent of NV
    /// sync, so an empty room doesn't stall forever.
    pub fn tick_readiness(&mut self, now: f64) -> bool {
        if let Some(connected_at) = self.connected_at {
            if !self.nv.is_ready() && now - connected_at >= INITIAL_SYNC_GRACE_SECS {
                self.nv.mark_initial_sync_done();
            }
        }

        let became_ready = self.is_ready() && self.state != SessionState::Ready;
        if became_ready {
            self.state = SessionState::Ready;
        }
        if self.state == SessionState::Ready && !self.ready_fired {
            self.ready_fired = true;
            self.events.push_back(NetSyncEvent::Ready);
            return true;
        }
        false
    }

    /// Periodic local transform send. Returns `true` if a fatal I/O error
    /// was observed and reconnection should begin.
    pub fn tick_send(&mut self) -> bool {
        let Some(io) = &self.io else { return false };

        let transform = match &self.mode {
            LocalMode::Stealth => ClientTransform::stealth(self.device_id.clone()),
            LocalMode::Visible(f) => f(),
        };
        if let Ok(encoded) = codec::encode_client_pose(&transform) {
            io.offer_transform(encoded);
        }

        if io.connection_error() {
            if let Some((reason, _observed_at)) = io.take_error() {
                self.events.push_back(NetSyncEvent::ConnectionError(reason));
            }
            self.enter_reconnecting();
            return true;
        }
        false
    }

    fn enter_reconnecting(&mut self) {
        self.state = SessionState::Reconnecting;
        self.client_no = 0;
        self.ready_fired = false;
        self.nv.reset();
        self.router.reset_room_state();
        self.peers.clear();
        if let Some(io) = self.io.take() {
            io.disconnect();
        }
    }

    /// Begins a room switch. Rejects a redundant switch or one already in
    /// flight; otherwise tears down current room state and returns `true`
    /// so the caller knows to reconnect with the new room id.
    pub fn switch_room(&mut self, new_room_id: &str) -> bool {
        if self.room_switch_in_progress || new_room_id == self.config.room_id {
            return false;
        }
        self.room_switch_in_progress = true;
        self.state = SessionState::TearingDown;
        self.client_no = 0;
        self.ready_fired = false;
        self.nv.reset();
        self.router.reset_room_state();
        self.peers.clear();
        self.config.room_id = new_room_id.to_string();
        if let Some(io) = self.io.take() {
            io.disconnect();
        }
        true
    }

    pub fn finish_room_switch(&mut self) {
        self.room_switch_in_progress = false;
    }

    /// Drains both router queues for one frame: room-pose snapshots feed
    /// the clock estimators and per-peer pose channels; general events
    /// resolve device mappings, merge NV updates, and deliver RPCs. Call
    /// once per frame, before [`Self::tick_channels`].
    pub fn tick_receive(&mut self, now: f64) {
        while let Some(snapshot) = self.router.drain_room_pose() {
            self.send_interval.observe(snapshot.broadcast_time);
            self.time_estimator.observe(now, snapshot.broadcast_time);
            let (events, forwarded) = self.router.apply_room_pose(snapshot);
            self.dispatch_router_session_events(events);
            for (client_no, entry) in forwarded {
                self.peer_applier(client_no).ingest_room_entry(&entry);
            }
        }

        while let Some(event) = self.router.drain_general() {
            self.handle_router_event(event);
        }
    }

    /// Advances every peer's pose channels against the estimated render
    /// clock (`serverNow - bufferMultiplier * sendInterval`) and returns
    /// this tick's smoothed poses, keyed by client no.
    pub fn tick_channels(&mut self, now: f64, dt: f64) -> HashMap<u16, AvatarPose> {
        let server_now = self.time_estimator.estimate_server_now(now);
        let interval = self.send_interval.interval();
        let multiplier = dynamic_buffer_multiplier(
            &self.buffer_settings,
            interval,
            self.time_estimator.jitter_std(),
            self.time_estimator.is_ready(),
        );
        let render_server_time = server_now - multiplier * interval;

        self.peers.iter_mut().map(|(&client_no, applier)| (client_no, applier.tick(render_server_time, dt))).collect()
    }

    /// Pops the next observable event, if any, in the order it occurred.
    pub fn drain_event(&mut self) -> Option<NetSyncEvent> {
        self.events.pop_front()
    }

    fn peer_applier(&mut self, client_no: u16) -> &mut AvatarTransformApplier {
        let capacity = self.config.snapshot_buffer_capacity;
        let smoothing = self.smoothing;
        self.peers.entry(client_no).or_insert_with(|| AvatarTransformApplier::new(capacity, smoothing))
    }

    fn dispatch_router_session_events(&mut self, events: Vec<RouterSessionEvent>) {
        for event in events {
            match event {
                RouterSessionEvent::AvatarConnected(client_no) => {
                    self.events.push_back(NetSyncEvent::AvatarConnected(client_no));
                }
                RouterSessionEvent::AvatarDisconnected(client_no) => {
                    self.peers.remove(&client_no);
                    self.events.push_back(NetSyncEvent::AvatarDisconnected(client_no));
                }
            }
        }
    }

    fn handle_router_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::DeviceIdMapping(frame) => {
                let (events, forwarded) = self.on_device_mapping(frame);
                self.dispatch_router_session_events(events);
                for (client_no, entry) in forwarded {
                    self.peer_applier(client_no).ingest_room_entry(&entry);
                }
            }
            RouterEvent::GlobalVarSet(frame) => {
                let record = VarRecord { value: frame.entry.value.clone(), timestamp: frame.entry.timestamp, last_writer: frame.entry.last_writer };
                if let Some(change) = self.nv.merge_global(&frame.entry.name, record) {
                    self.events.push_back(NetSyncEvent::GlobalVariableChanged { name: change.name, old: change.old, new: change.new });
                }
            }
            RouterEvent::GlobalVarSync(frame) => {
                for entry in frame.entries {
                    let record = VarRecord { value: entry.value.clone(), timestamp: entry.timestamp, last_writer: entry.last_writer };
                    if let Some(change) = self.nv.merge_global(&entry.name, record) {
                        self.events.push_back(NetSyncEvent::GlobalVariableChanged { name: change.name, old: change.old, new: change.new });
                    }
                }
                self.on_initial_nv_sync();
            }
            RouterEvent::ClientVarSet(frame) => {
                let record = VarRecord { value: frame.entry.value.clone(), timestamp: frame.entry.timestamp, last_writer: frame.entry.last_writer };
                if let Some(change) = self.nv.merge_client(frame.target, &frame.entry.name, record) {
                    self.events.push_back(NetSyncEvent::ClientVariableChanged { client_no: change.client_no, name: change.name, old: change.old, new: change.new });
                }
            }
            RouterEvent::ClientVarSync(frame) => {
                for (client_no, vars) in frame.per_client {
                    for entry in vars {
                        let record = VarRecord { value: entry.value.clone(), timestamp: entry.timestamp, last_writer: entry.last_writer };
                        if let Some(change) = self.nv.merge_client(client_no, &entry.name, record) {
                            self.events.push_back(NetSyncEvent::ClientVariableChanged { client_no: change.client_no, name: change.name, old: change.old, new: change.new });
                        }
                    }
                }
                self.on_initial_nv_sync();
            }
            RouterEvent::Rpc(frame) => {
                let args = wire::parse_rpc_arguments(&frame.arguments_json);
                self.events.push_back(NetSyncEvent::RpcReceived {
                    sender_client_no: frame.sender_client_no,
                    name: frame.function_name,
                    args,
                });
            }
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn io(&self) -> Option<&IoCoreHandle> {
        self.io.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_core::SendOutcome;
    use std::time::Duration;

    struct NullTransport;
    impl Transport for NullTransport {
        fn send(&mut self, _room_id: &str, _payload: &[u8]) -> SendOutcome {
            SendOutcome::Sent
        }
        fn recv_timeout(&mut self, _timeout: Duration) -> Option<(String, Vec<u8>)> {
            None
        }
    }

    fn controller() -> SessionController {
        SessionController::new(SessionConfig::default(), "device-a", LocalMode::Stealth)
    }

    #[test]
    fn not_ready_until_client_no_and_nv_sync() {
        let mut c = controller();
        assert!(!c.is_ready());
        c.client_no = 7;
        assert!(!c.is_ready());
        c.nv.mark_initial_sync_done();
        assert!(c.is_ready());
    }

    #[test]
    fn readiness_gate_times_out_without_nv_sync() {
        let mut c = controller();
        c.attach_transport(NullTransport, || 0.0);
        c.client_no = 7;
        assert!(!c.tick_readiness(0.5));
        assert!(c.tick_readiness(2.1));
    }

    #[test]
    fn room_switch_rejects_duplicate_and_in_flight() {
        let mut c = controller();
        assert!(!c.switch_room("default_room"));
        assert!(c.switch_room("other_room"));
        assert!(!c.switch_room("yet_another"));
        c.finish_room_switch();
        assert!(c.switch_room("yet_another"));
    }

    #[test]
    fn disconnected_session_send_is_a_no_op() {
        let mut c = controller();
        assert!(!c.tick_send());
    }

    #[test]
    fn device_mapping_resolves_own_client_no() {
        let mut c = controller();
        let frame = crate::wire::DeviceIdMappingFrame {
            server_version: crate::types::ServerVersion::default(),
            entries: vec![(
                crate::types::DeviceMappingEntry { client_no: 9, is_stealth: true },
                "device-a".to_string(),
            )],
        };
        c.on_device_mapping(frame);
        assert_eq!(c.client_no(), 9);
    }

    #[test]
    fn tick_receive_routes_device_mapping_through_the_router() {
        let mut c = controller();
        let frame = crate::wire::DeviceIdMappingFrame {
            server_version: crate::types::ServerVersion::default(),
            entries: vec![(
                crate::types::DeviceMappingEntry { client_no: 9, is_stealth: true },
                "device-a".to_string(),
            )],
        };
        c.router.ingest(&crate::wire::encode_device_mapping(&frame).unwrap());
        c.tick_receive(0.0);
        assert_eq!(c.client_no(), 9);
    }

    #[test]
    fn tick_receive_merges_global_var_sync_and_marks_initial_sync_done() {
        let mut c = controller();
        let frame = crate::wire::GlobalVarSyncFrame {
            entries: vec![crate::wire::VarEntry { name: "score".into(), value: "10".into(), timestamp: 1.0, last_writer: 3 }],
        };
        c.router.ingest(&crate::wire::encode_global_var_sync(&frame).unwrap());
        c.tick_receive(0.0);

        assert!(c.nv.is_ready());
        assert_eq!(c.nv.get_global("score"), Some("10"));
        match c.drain_event() {
            Some(NetSyncEvent::GlobalVariableChanged { name, new, .. }) => {
                assert_eq!(name, "score");
                assert_eq!(new, "10");
            }
            other => panic!("expected GlobalVariableChanged, got {other:?}"),
        }
    }

    #[test]
    fn tick_receive_delivers_rpc_with_parsed_arguments() {
        let mut c = controller();
        let frame = crate::wire::RpcFrame {
            sender_client_no: 5,
            function_name: "ping".to_string(),
            arguments_json: "[1,2,3]".to_string(),
        };
        c.router.ingest(&crate::wire::encode_rpc(&frame).unwrap());
        c.tick_receive(0.0);

        match c.drain_event() {
            Some(NetSyncEvent::RpcReceived { sender_client_no, name, args }) => {
                assert_eq!(sender_client_no, 5);
                assert_eq!(name, "ping");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected RpcReceived, got {other:?}"),
        }
    }

    #[test]
    fn connection_error_surfaces_as_event_instead_of_being_discarded() {
        let mut c = controller();
        c.attach_transport(NullTransport, || 0.0);
        // No transport failure is injected here since `NullTransport` never
        // errors; this exercises the no-error path end to end and confirms
        // `tick_send` still reports `false` without a spurious event.
        assert!(!c.tick_send());
        assert!(c.drain_event().is_none());
    }
}
