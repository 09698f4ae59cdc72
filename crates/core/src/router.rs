//! Demultiplexes inbound frames by type byte, maintains the device/client
//! mapping table, and resolves the pending-spawn race between a `RoomPose`
//! entry and the `DeviceIdMapping` that names it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::codec::{self, MessageType};
use crate::types::{DeviceMappingEntry, RoomClientEntry, RoomTransformSnapshot, ServerVersion};
use crate::wire::{self, DeviceIdMappingFrame, GlobalVarSetFrame, GlobalVarSyncFrame, ClientVarSetFrame, ClientVarSyncFrame, RpcFrame};

const ROOM_POSE_QUEUE_DEPTH: usize = 2;

/// Implemented by [`MessageRouter`]; the trait boundary exists so the I/O
/// core can hold an `Arc<dyn RouterSink>` without depending on the router's
/// concrete state.
pub trait RouterSink: Send + Sync {
    fn ingest(&self, payload: &[u8]);
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    Rpc(RpcFrame),
    DeviceIdMapping(DeviceIdMappingFrame),
    GlobalVarSet(GlobalVarSetFrame),
    GlobalVarSync(GlobalVarSyncFrame),
    ClientVarSet(ClientVarSetFrame),
    ClientVarSync(ClientVarSyncFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    AvatarConnected(u16),
    AvatarDisconnected(u16),
}

struct RouterState {
    room_pose_queue: VecDeque<RoomTransformSnapshot>,
    general_queue: VecDeque<RouterEvent>,
    mapping: HashMap<u16, (String, bool)>,
    server_version: ServerVersion,
    pending_spawn: HashMap<u16, RoomClientEntry>,
    known_connected: HashSet<u16>,
}

pub struct MessageRouter {
    local_client_no: Mutex<u16>,
    state: Mutex<RouterState>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            local_client_no: Mutex::new(0),
            state: Mutex::new(RouterState {
                room_pose_queue: VecDeque::new(),
                general_queue: VecDeque::new(),
                mapping: HashMap::new(),
                server_version: ServerVersion::default(),
                pending_spawn: HashMap::new(),
                known_connected: HashSet::new(),
            }),
        }
    }

    pub fn set_local_client_no(&self, client_no: u16) {
        *self.local_client_no.lock().unwrap() = client_no;
    }

    /// Resets all per-room state: mapping table, pending spawns, known
    /// peers, and queued frames. Used on room switch and reconnect.
    pub fn reset_room_state(&self) {
        let mut state = self.state.lock().unwrap();
        state.room_pose_queue.clear();
        state.general_queue.clear();
        state.mapping.clear();
        state.pending_spawn.clear();
        state.known_connected.clear();
    }

    pub fn drain_room_pose(&self) -> Option<RoomTransformSnapshot> {
        self.state.lock().unwrap().room_pose_queue.pop_front()
    }

    pub fn drain_general(&self) -> Option<RouterEvent> {
        self.state.lock().unwrap().general_queue.pop_front()
    }

    pub fn device_id_for(&self, client_no: u16) -> Option<String> {
        self.state.lock().unwrap().mapping.get(&client_no).map(|(id, _)| id.clone())
    }

    pub fn is_stealth(&self, client_no: u16) -> bool {
        self.state.lock().unwrap().mapping.get(&client_no).map(|(_, s)| *s).unwrap_or(false)
    }

    pub fn server_version(&self) -> ServerVersion {
        self.state.lock().unwrap().server_version
    }

    /// Applies a `DeviceIdMapping` frame: swaps the mapping table and
    /// resolves any pending spawns it newly covers. Returns the connect
    /// events for peers spawned as a result plus their queued transform.
    pub fn apply_device_mapping(
        &self,
        frame: DeviceIdMappingFrame,
    ) -> (Vec<SessionEvent>, Vec<(u16, RoomClientEntry)>) {
        let mut state = self.state.lock().unwrap();
        state.server_version = frame.server_version;
        state.mapping = frame
            .entries
            .iter()
            .map(|(entry, device_id)| (entry.client_no, (device_id.clone(), entry.is_stealth)))
            .collect();

        let mut events = Vec::new();
        let mut forwarded = Vec::new();
        let resolved: Vec<u16> = state
            .pending_spawn
            .keys()
            .copied()
            .filter(|client_no| state.mapping.contains_key(client_no))
            .collect();

        for client_no in resolved {
            if let Some(entry) = state.pending_spawn.remove(&client_no) {
                if state.known_connected.insert(client_no) {
                    events.push(SessionEvent::AvatarConnected(client_no));
                }
                forwarded.push((client_no, entry));
            }
        }

        (events, forwarded)
    }

    /// Applies one `RoomPose` snapshot: routes each remote entry either to
    /// "forward to an already-spawned avatar" or "pending spawn", and emits
    /// disconnect events for peers absent from this frame.
    pub fn apply_room_pose(
        &self,
        snapshot: RoomTransformSnapshot,
    ) -> (Vec<SessionEvent>, Vec<(u16, RoomClientEntry)>) {
        let local = *self.local_client_no.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let mut events = Vec::new();
        let mut forwarded = Vec::new();
        let mut live: HashSet<u16> = HashSet::new();

        for entry in snapshot.clients {
            if entry.client_no == local {
                continue;
            }
            live.insert(entry.client_no);

            if state.mapping.contains_key(&entry.client_no) {
                if state.known_connected.insert(entry.client_no) {
                    events.push(SessionEvent::AvatarConnected(entry.client_no));
                }
                forwarded.push((entry.client_no, entry));
            } else {
                state.pending_spawn.insert(entry.client_no, entry);
            }
        }

        let departed: Vec<u16> = state.known_connected.difference(&live).copied().collect();
        for client_no in departed {
            state.known_connected.remove(&client_no);
            events.push(SessionEvent::AvatarDisconnected(client_no));
        }

        (events, forwarded)
    }
}

impl RouterSink for MessageRouter {
    fn ingest(&self, payload: &[u8]) {
        let Some(&type_byte) = payload.first() else {
            log::debug!("router: empty payload");
            return;
        };
        let Some(kind) = MessageType::from_byte(type_byte) else {
            log::debug!("router: unknown message type {type_byte}");
            return;
        };

        match kind {
            MessageType::RoomPose => {
                let Some(snapshot) = codec::decode_room_pose(payload) else {
                    log::warn!("router: malformed RoomPose frame");
                    return;
                };
                let mut state = self.state.lock().unwrap();
                if state.room_pose_queue.len() >= ROOM_POSE_QUEUE_DEPTH {
                    state.room_pose_queue.pop_front();
                }
                state.room_pose_queue.push_back(snapshot);
            }
            MessageType::ClientPose => {
                // The client-side library never receives its own pose type
                // from the server; a peer so inclined is ignored.
            }
            MessageType::Rpc => {
                if let Some(frame) = wire::decode_rpc(payload) {
                    self.push_general(RouterEvent::Rpc(frame));
                } else {
                    log::warn!("router: malformed RPC frame");
                }
            }
            MessageType::DeviceIdMapping => {
                if let Some(frame) = wire::decode_device_mapping(payload) {
                    self.push_general(RouterEvent::DeviceIdMapping(frame));
                } else {
                    log::warn!("router: malformed DeviceIdMapping frame");
                }
            }
            MessageType::GlobalVarSet => {
                if let Some(frame) = wire::decode_global_var_set(payload) {
                    self.push_general(RouterEvent::GlobalVarSet(frame));
                } else {
                    log::warn!("router: malformed GlobalVarSet frame");
                }
            }
            MessageType::GlobalVarSync => {
                if let Some(frame) = wire::decode_global_var_sync(payload) {
                    self.push_general(RouterEvent::GlobalVarSync(frame));
                } else {
                    log::warn!("router: malformed GlobalVarSync frame");
                }
            }
            MessageType::ClientVarSet => {
                if let Some(frame) = wire::decode_client_var_set(payload) {
                    self.push_general(RouterEvent::ClientVarSet(frame));
                } else {
                    log::warn!("router: malformed ClientVarSet frame");
                }
            }
            MessageType::ClientVarSync => {
                if let Some(frame) = wire::decode_client_var_sync(payload) {
                    self.push_general(RouterEvent::ClientVarSync(frame));
                } else {
                    log::warn!("router: malformed ClientVarSync frame");
                }
            }
        }
    }
}

impl MessageRouter {
    fn push_general(&self, event: RouterEvent) {
        self.state.lock().unwrap().general_queue.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncodingFlags, PoseFlags};

    fn entry(client_no: u16) -> RoomClientEntry {
        RoomClientEntry {
            client_no,
            pose_time: 0.0,
            pose_seq: 1,
            flags: PoseFlags::HEAD_VALID,
            encoding_flags: EncodingFlags::default(),
            physical: None,
            head: None,
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        }
    }

    #[test]
    fn unmapped_peer_goes_to_pending_spawn() {
        let router = MessageRouter::new();
        router.set_local_client_no(7);

        let snapshot = RoomTransformSnapshot { room_id: "r".into(), broadcast_time: 0.0, clients: vec![entry(8)] };
        let (events, forwarded) = router.apply_room_pose(snapshot);
        assert!(events.is_empty());
        assert!(forwarded.is_empty());
    }

    #[test]
    fn mapping_after_pose_resolves_pending_spawn_exactly_once() {
        let router = MessageRouter::new();
        router.set_local_client_no(7);

        let snapshot = RoomTransformSnapshot { room_id: "r".into(), broadcast_time: 0.0, clients: vec![entry(8)] };
        router.apply_room_pose(snapshot);

        let mapping = DeviceIdMappingFrame {
            server_version: ServerVersion { major: 1, minor: 0, patch: 0 },
            entries: vec![(DeviceMappingEntry { client_no: 8, is_stealth: false }, "device-b".into())],
        };
        let (events, forwarded) = router.apply_device_mapping(mapping);
        assert_eq!(events, vec![SessionEvent::AvatarConnected(8)]);
        assert_eq!(forwarded.len(), 1);

        // A later pose for the same client no longer goes through pending
        // spawn and never re-fires the connect event.
        let snapshot2 = RoomTransformSnapshot { room_id: "r".into(), broadcast_time: 1.0, clients: vec![entry(8)] };
        let (events2, forwarded2) = router.apply_room_pose(snapshot2);
        assert!(events2.is_empty());
        assert_eq!(forwarded2.len(), 1);
    }

    #[test]
    fn departure_emits_disconnect() {
        let router = MessageRouter::new();
        router.set_local_client_no(7);

        let mapping = DeviceIdMappingFrame {
            server_version: ServerVersion::default(),
            entries: vec![(DeviceMappingEntry { client_no: 8, is_stealth: false }, "device-b".into())],
        };
        router.apply_device_mapping(mapping);
        router.apply_room_pose(RoomTransformSnapshot { room_id: "r".into(), broadcast_time: 0.0, clients: vec![entry(8)] });

        let (events, _) = router.apply_room_pose(RoomTransformSnapshot { room_id: "r".into(), broadcast_time: 1.0, clients: vec![] });
        assert_eq!(events, vec![SessionEvent::AvatarDisconnected(8)]);
    }

    #[test]
    fn room_pose_queue_keeps_only_latest_two() {
        let router = MessageRouter::new();
        for i in 0..5u16 {
            router.ingest(&codec::encode_room_pose(&RoomTransformSnapshot {
                room_id: "r".into(),
                broadcast_time: i as f64,
                clients: vec![],
            }).unwrap());
        }
        let mut count = 0;
        while router.drain_room_pose().is_some() {
            count += 1;
        }
        assert_eq!(count, ROOM_POSE_QUEUE_DEPTH);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let router = MessageRouter::new();
        router.ingest(&[250, 1, 2, 3]);
        assert!(router.drain_general().is_none());
    }
}
