pub mod applier;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod io_core;
pub mod netvars;
pub mod persist;
pub mod router;
pub mod rpc;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod util;
pub mod wire;

pub use applier::{AvatarPose, AvatarTransformApplier, SingleTransformApplier, SmoothingSettings};
pub use clock::{BufferMultiplierSettings, EwmaMeanStd, SendIntervalEstimator, TimeEstimator};
pub use codec::{MessageType, PROTOCOL_VERSION};
pub use config::SessionConfig;
pub use error::{NetSyncError, Result};
pub use io_core::{IoCoreHandle, SendOutcome, Transport};
pub use netvars::{ClientVarChange, GlobalVarChange, NvStore, VarRecord};
pub use router::{MessageRouter, RouterEvent, RouterSink, SessionEvent};
pub use rpc::{RpcChannel, RpcSettings, SendDecision};
pub use session::{LocalMode, NetSyncEvent, SessionController, SessionState};
pub use snapshot::{PoseChannel, PoseChannelSettings, SnapshotBuffer};
pub use types::{
    ClientTransform, DeviceMappingEntry, EncodingFlags, PhysicalPose, Pose3, PoseFlags,
    RoomClientEntry, RoomTransformSnapshot, ServerVersion, MAX_VIRTUALS,
};
