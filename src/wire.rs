//! Line format shared by publishers and the bridge.
//!
//! A reading travels as one ASCII line of exactly [`FIELD_COUNT`] fields
//! separated by [`DELIMITER`]:
//!
//! ```text
//! device:device_class:state_class:measurement:unit:value:icon_ns:icon_id:version:model:category
//! ```
//!
//! Empty fields are zero-length tokens. Lines with any other number of fields
//! are rejected as a whole.

use std::fmt;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const DELIMITER: char = ':';
pub const FIELD_COUNT: usize = 11;
/// Largest payload the radio carries. Longer input is truncated, not rejected.
pub const MAX_LINE_LEN: usize = 250;

const SUBSTITUTE: char = '_';

const DEVICE_NAME: usize = 0;
const DEVICE_CLASS: usize = 1;
const STATE_CLASS: usize = 2;
const MEASUREMENT: usize = 3;
const UNIT: usize = 4;
const VALUE: usize = 5;
const ICON_NAMESPACE: usize = 6;
const ICON_ID: usize = 7;
const FIRMWARE_VERSION: usize = 8;
const MODEL: usize = 9;
const CATEGORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sensor,
    BinarySensor,
    TextSensor,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sensor => "sensor",
            Category::BinarySensor => "binary_sensor",
            Category::TextSensor => "text_sensor",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "sensor" => Some(Category::Sensor),
            "binary_sensor" => Some(Category::BinarySensor),
            "text_sensor" => Some(Category::TextSensor),
            _ => None,
        }
    }

    /// Topic segment the bridge publishes under. Text sensors share the plain
    /// sensor shape.
    pub fn topic_segment(&self) -> &'static str {
        match self {
            Category::BinarySensor => "binary_sensor",
            Category::Sensor | Category::TextSensor => "sensor",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedPacket {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("payload is not valid UTF-8")]
    Encoding,
}

/// One observation, ready to be put on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub device_name: String,
    pub category: Category,
    pub device_class: String,
    /// Only carried for [`Category::Sensor`].
    pub state_class: String,
    pub measurement_name: String,
    /// Dropped for binary and text sensors.
    pub unit: String,
    pub value: String,
    pub icon: String,
    pub firmware_version: String,
    pub model: String,
}

impl Reading {
    /// Serializes the reading into a wire line.
    ///
    /// Delimiters and NULs inside fields are replaced with `_`, except for the
    /// single delimiter separating the icon namespace from its identifier, so
    /// the output always has exactly [`FIELD_COUNT`] fields.
    pub fn encode(&self) -> String {
        let (icon_namespace, icon_id) = split_icon(&self.icon);
        let (state_class, unit) = match self.category {
            Category::Sensor => (self.state_class.as_str(), self.unit.as_str()),
            Category::BinarySensor => (Category::BinarySensor.as_str(), ""),
            Category::TextSensor => ("", ""),
        };

        let fields: [&str; FIELD_COUNT] = [
            &self.device_name,
            &self.device_class,
            state_class,
            &self.measurement_name,
            unit,
            &self.value,
            icon_namespace,
            icon_id,
            &self.firmware_version,
            &self.model,
            self.category.as_str(),
        ];

        let mut line = String::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                line.push(DELIMITER);
            }
            push_sanitized(&mut line, field);
        }
        line
    }
}

fn split_icon(icon: &str) -> (&str, &str) {
    icon.split_once(DELIMITER).unwrap_or(("", icon))
}

fn push_sanitized(line: &mut String, field: &str) {
    line.extend(field.chars().map(|c| match c {
        DELIMITER | '\0' => SUBSTITUTE,
        c => c,
    }));
}

/// A received line split into its fields. Borrows the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    tokens: [&'a str; FIELD_COUNT],
}

impl<'a> Frame<'a> {
    pub fn tokens(&self) -> &[&'a str; FIELD_COUNT] {
        &self.tokens
    }

    pub fn device_name(&self) -> &'a str {
        self.tokens[DEVICE_NAME]
    }

    pub fn device_class(&self) -> &'a str {
        self.tokens[DEVICE_CLASS]
    }

    pub fn state_class(&self) -> &'a str {
        match self.category() {
            Category::Sensor => self.tokens[STATE_CLASS],
            _ => "",
        }
    }

    pub fn measurement_name(&self) -> &'a str {
        self.tokens[MEASUREMENT]
    }

    pub fn unit(&self) -> &'a str {
        self.tokens[UNIT]
    }

    pub fn value(&self) -> &'a str {
        self.tokens[VALUE]
    }

    /// Rejoins the two icon tokens. `None` unless both halves are present.
    pub fn icon(&self) -> Option<String> {
        let namespace = self.tokens[ICON_NAMESPACE];
        let id = self.tokens[ICON_ID];
        if namespace.is_empty() || id.is_empty() {
            return None;
        }
        Some(format!("{namespace}{DELIMITER}{id}"))
    }

    pub fn firmware_version(&self) -> &'a str {
        self.tokens[FIRMWARE_VERSION]
    }

    pub fn model(&self) -> &'a str {
        self.tokens[MODEL]
    }

    /// Trailing marker first, then the `binary_sensor` tag older publishers put
    /// in the state class slot. Anything unrecognised is a plain sensor.
    pub fn category(&self) -> Category {
        Category::from_marker(self.tokens[CATEGORY]).unwrap_or_else(|| {
            if self.tokens[STATE_CLASS] == Category::BinarySensor.as_str() {
                Category::BinarySensor
            } else {
                Category::Sensor
            }
        })
    }

    pub fn to_reading(&self) -> Reading {
        Reading {
            device_name: self.device_name().to_string(),
            category: self.category(),
            device_class: self.device_class().to_string(),
            state_class: self.state_class().to_string(),
            measurement_name: self.measurement_name().to_string(),
            unit: self.unit().to_string(),
            value: self.value().to_string(),
            icon: self.icon().unwrap_or_default(),
            firmware_version: self.firmware_version().to_string(),
            model: self.model().to_string(),
        }
    }
}

/// Splits a received payload into a [`Frame`].
///
/// At most [`MAX_LINE_LEN`] bytes are looked at and scanning stops at the first
/// NUL. A multi-byte character cut by the length cap is dropped.
pub fn decode(bytes: &[u8]) -> Result<Frame<'_>, MalformedPacket> {
    let bounded = &bytes[..bytes.len().min(MAX_LINE_LEN)];
    let bounded = match bounded.iter().position(|&b| b == 0) {
        Some(end) => &bounded[..end],
        None => bounded,
    };

    let line = match std::str::from_utf8(bounded) {
        Ok(line) => line,
        Err(err) if err.error_len().is_none() => std::str::from_utf8(&bounded[..err.valid_up_to()])
            .map_err(|_| MalformedPacket::Encoding)?,
        Err(_) => return Err(MalformedPacket::Encoding),
    };

    let got = line.split(DELIMITER).count();
    if got != FIELD_COUNT {
        return Err(MalformedPacket::FieldCount {
            expected: FIELD_COUNT,
            got,
        });
    }

    let mut tokens = [""; FIELD_COUNT];
    for (slot, token) in tokens.iter_mut().zip(line.split(DELIMITER)) {
        *slot = token;
    }
    Ok(Frame { tokens })
}
