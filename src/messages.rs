use crate::presence::DeviceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePresence {
    Online,
    Offline,
}

impl DevicePresence {
    pub fn as_payload(&self) -> &'static str {
        match self {
            DevicePresence::Online => "online",
            DevicePresence::Offline => "offline",
        }
    }
}

/// Emitted by the presence tracker whenever a device changes state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub name: String,
    pub device_key: DeviceKey,
    pub presence: DevicePresence,
}
