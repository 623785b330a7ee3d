use crate::config::SensorConfig;
use crate::wire::{Category, Reading};

/// Identity shared by every reading a node sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub firmware_version: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Number(f64),
    Binary(bool),
    Text(String),
}

/// Sensor metadata plus the most recent value.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub kind: Category,
    pub device_class: String,
    pub state_class: String,
    pub unit: String,
    pub icon: String,
    pub accuracy_decimals: i8,
    state: Option<SensorValue>,
}

impl Sensor {
    pub fn from_config(config: &SensorConfig) -> Self {
        Sensor {
            name: config.name.clone(),
            kind: config.kind(),
            device_class: config.device_class.clone().unwrap_or_default(),
            state_class: config.state_class.clone().unwrap_or_default(),
            unit: config.unit.clone().unwrap_or_default(),
            icon: config.icon.clone().unwrap_or_default(),
            accuracy_decimals: config.accuracy_decimals.unwrap_or(2),
            state: None,
        }
    }

    /// Stores a new value. Returns whether it differs from the previous one.
    pub fn publish_state(&mut self, value: SensorValue) -> bool {
        let changed = self.state.as_ref() != Some(&value);
        self.state = Some(value);
        changed
    }

    pub fn parse(&self, output: &str) -> Option<SensorValue> {
        let output = output.trim();
        match self.kind {
            Category::Sensor => output.parse::<f64>().ok().map(SensorValue::Number),
            Category::BinarySensor => parse_binary(output).map(SensorValue::Binary),
            Category::TextSensor => Some(SensorValue::Text(output.to_string())),
        }
    }

    pub fn format_value(&self, value: &SensorValue) -> String {
        match value {
            SensorValue::Number(number) => {
                let decimals = usize::try_from(self.accuracy_decimals).unwrap_or(0);
                format!("{:.*}", decimals, number)
            }
            SensorValue::Binary(true) => "ON".to_string(),
            SensorValue::Binary(false) => "OFF".to_string(),
            SensorValue::Text(text) => text.clone(),
        }
    }

    /// Reading for the current state, if the sensor has one.
    pub fn reading(&self, device: &DeviceIdentity) -> Option<Reading> {
        let value = self.state.as_ref()?;
        Some(Reading {
            device_name: snake_case(&device.name),
            category: self.kind,
            device_class: self.device_class.clone(),
            state_class: self.state_class.clone(),
            measurement_name: snake_case(&self.name),
            unit: self.unit.clone(),
            value: self.format_value(value),
            icon: self.icon.clone(),
            firmware_version: device.firmware_version.clone(),
            model: device.model.clone(),
        })
    }
}

fn parse_binary(output: &str) -> Option<bool> {
    match output.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Lowercases and replaces anything that is not alphanumeric with `_`, so
/// names are safe both in topics and on the wire.
pub fn snake_case(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> Sensor {
        Sensor {
            name: "Outside Temp".to_string(),
            kind: Category::Sensor,
            device_class: "temperature".to_string(),
            state_class: "measurement".to_string(),
            unit: "°C".to_string(),
            icon: "mdi:thermometer".to_string(),
            accuracy_decimals: 1,
            state: None,
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            name: "Garden Node".to_string(),
            firmware_version: "0.1.0".to_string(),
            model: "esp32dev".to_string(),
        }
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("Test's Device 123"), "test_s_device_123");
        assert_eq!(snake_case("a:b/c"), "a_b_c");
    }

    #[test]
    fn test_no_reading_without_state() {
        let sensor = temperature();
        assert!(sensor.reading(&identity()).is_none());
    }

    #[test]
    fn test_reading_from_state() {
        let mut sensor = temperature();
        let value = sensor.parse(" 21.46\n").unwrap();
        assert!(sensor.publish_state(value.clone()));
        assert!(!sensor.publish_state(value));

        let reading = sensor.reading(&identity()).unwrap();
        assert_eq!(reading.device_name, "garden_node");
        assert_eq!(reading.measurement_name, "outside_temp");
        assert_eq!(reading.value, "21.5");
        assert_eq!(
            reading.encode(),
            "garden_node:temperature:measurement:outside_temp:°C:21.5:mdi:thermometer:0.1.0:esp32dev:sensor"
        );
    }

    #[test]
    fn test_value_formatting() {
        let mut sensor = temperature();
        sensor.accuracy_decimals = -1;
        assert_eq!(sensor.format_value(&SensorValue::Number(21.46)), "21");
        sensor.accuracy_decimals = 3;
        assert_eq!(sensor.format_value(&SensorValue::Number(1.0)), "1.000");
        assert_eq!(sensor.format_value(&SensorValue::Binary(true)), "ON");
        assert_eq!(sensor.format_value(&SensorValue::Binary(false)), "OFF");
    }

    #[test]
    fn test_parse_by_kind() {
        let mut sensor = temperature();
        assert_eq!(sensor.parse("not a number"), None);

        sensor.kind = Category::BinarySensor;
        assert_eq!(sensor.parse("ON"), Some(SensorValue::Binary(true)));
        assert_eq!(sensor.parse("0"), Some(SensorValue::Binary(false)));
        assert_eq!(sensor.parse("maybe"), None);

        sensor.kind = Category::TextSensor;
        assert_eq!(
            sensor.parse("  idle \n"),
            Some(SensorValue::Text("idle".to_string()))
        );
    }
}
