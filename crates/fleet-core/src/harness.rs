//! Wiring harness: the per-device mapping from digital IO bits to
//! human-readable signal names.

use serde::{Deserialize, Serialize};

/// Inputs and outputs per harness.
pub const HARNESS_IO_COUNT: usize = 16;

/// Input bit carrying the battery-OK sense line on the default wiring.
/// IO-change events that only touch this bit are dropped as noise.
pub const BAT_DOK_BIT: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Harness {
    pub name: String,
    /// One name per input bit, low bit first.
    pub input_names: Vec<String>,
    /// One name per output bit, low bit first.
    pub output_names: Vec<String>,
    /// Opaque per-input configuration bytes.
    pub input_config: Vec<Vec<u8>>,
}

impl Harness {
    /// The lazily-created `"default"` harness every new device references.
    pub fn default_harness() -> Harness {
        let mut input_names: Vec<String> =
            (1..=HARNESS_IO_COUNT).map(|i| format!("IN{i}")).collect();
        input_names[BAT_DOK_BIT] = "BAT_DOK".to_owned();
        Harness {
            name: "default".to_owned(),
            input_names,
            output_names: (1..=HARNESS_IO_COUNT).map(|i| format!("OUT{i}")).collect(),
            input_config: vec![Vec::new(); HARNESS_IO_COUNT],
        }
    }

    pub fn input_name(&self, bit: usize) -> &str {
        self.input_names.get(bit).map_or("?", String::as_str)
    }

    pub fn output_name(&self, bit: usize) -> &str {
        self.output_names.get(bit).map_or("?", String::as_str)
    }
}
