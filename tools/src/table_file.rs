//! Descriptor tables described in JSON.
//!
//! ```json
//! {
//!   "device": [18, 1, 16, 1, 0, 0, 0, 8, 9, 18, 1, 0, 0, 1, 1, 2, 0, 1],
//!   "configuration": [9, 2, 34, 0, ...],
//!   "strings": ["softusb", "HID Keyboard"],
//!   "hid_report": [5, 1, 9, 6, ...]
//! }
//! ```
//!
//! `strings` holds the text of string descriptors 1 and up; descriptor 0 is generated from
//! `language_ids`, which defaults to US English.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use softusb::descriptors::string_descriptor;
use softusb::DescriptorTable;

use crate::SimError;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TableFile {
    pub device: Vec<u8>,
    pub configuration: Vec<u8>,
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default = "default_languages")]
    pub language_ids: Vec<u16>,
    pub hid_report: Vec<u8>,
}

fn default_languages() -> Vec<u16> { vec![0x0409] }

impl TableFile {
    pub fn into_table(self) -> Result<DescriptorTable, SimError> {
        let mut languages = vec![0, 3];
        for id in self.language_ids.iter() {
            languages.extend_from_slice(&id.to_le_bytes());
        }
        languages[0] = languages.len() as u8;
        let mut strings = vec![languages];
        strings.extend(self.strings.iter().map(|s| string_descriptor(s)));
        Ok(DescriptorTable::new(self.device, self.configuration, strings, self.hid_report)?)
    }
}

pub fn load(path: &Path) -> Result<DescriptorTable, SimError> {
    let file = File::open(path)?;
    let parsed: TableFile = serde_json::from_reader(BufReader::new(file))?;
    log::debug!("loaded {} strings from {}", parsed.strings.len(), path.display());
    parsed.into_table()
}
