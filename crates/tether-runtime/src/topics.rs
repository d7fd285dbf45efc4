//! Channel topics served by the module context and the main context.

pub const INCREMENT_ARC: &str = "IncrementArc";
pub const DECREMENT_ARC: &str = "DecrementArc";
pub const DEALLOC_VEC: &str = "DeallocVec";
pub const CREATE_BUFFER: &str = "CreateBuffer";
pub const CREATE_READ_ONLY_BUFFER: &str = "CreateReadOnlyBuffer";
pub const CALL_MODULE: &str = "CallModule";

/// Served by the main context: start a thread for a region allocated by the sender.
pub const THREAD_SPAWN: &str = "ThreadSpawn";

/// Every topic the module context serves. Relays forward exactly these.
pub const MODULE_TOPICS: &[&str] = &[
    INCREMENT_ARC,
    DECREMENT_ARC,
    DEALLOC_VEC,
    CREATE_BUFFER,
    CREATE_READ_ONLY_BUFFER,
    CALL_MODULE,
];
