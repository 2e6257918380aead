//! Appliance topic naming.
//!
//! Requests to a device live under `$EDC/ari/<device id>/ar1/...`; replies come
//! back under a device-specific prefix and are told apart by their suffix.

/// Namespace every request topic starts with.
pub const TOPIC_PREFIX: &str = "$EDC/ari";

/// Path segment marking gateway-internal traffic, which is never relayed.
pub const INLINE_SEGMENT: &str = "/inline/";

/// Topic of a parameter read request.
pub fn read_request_topic(device_id: &str) -> String {
    format!("{}/{}/ar1/GET/Menu/Par", TOPIC_PREFIX, device_id)
}

/// Topic of a parameter write request.
pub fn write_request_topic(device_id: &str) -> String {
    format!("{}/{}/ar1/PUT/Menu/Par", TOPIC_PREFIX, device_id)
}

/// Topic of a consumption read request.
pub fn consumption_request_topic(device_id: &str) -> String {
    format!("{}/{}/ar1/GET/Stat/cWh", TOPIC_PREFIX, device_id)
}

/// What a published message carries, judged by its topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Birth,
    ParamsReply,
    ConsumptionsReply,
    ErrorList,
    Other,
}

impl TopicKind {
    /// Classify a topic; the first matching suffix wins.
    pub fn of(topic: &str) -> Self {
        if topic.ends_with("/BIRTH") {
            TopicKind::Birth
        } else if topic.ends_with("/REPLY/params") {
            TopicKind::ParamsReply
        } else if topic.ends_with("/REPLY/consumptions") {
            TopicKind::ConsumptionsReply
        } else if topic.ends_with("/ErrListRst") {
            TopicKind::ErrorList
        } else {
            TopicKind::Other
        }
    }
}

/// Whether a topic belongs to the gateway-internal namespace.
pub fn is_internal(topic: &str) -> bool {
    topic.contains(INLINE_SEGMENT)
}
