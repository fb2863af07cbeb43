// POL File Store
//
// In-memory registry store backed by the Group Policy `PReg` container:
//
//   u32 signature "PReg", u32 version 1, then records of
//   [key\0;name\0;type;size;data]
//
// where brackets, semicolons and strings are UTF-16LE and integers are
// little-endian. Deletions are recorded as marker values (`**del.<name>`,
// `**delvals.`) so they survive the round trip to the policy engine.

use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;

use super::{
    RegistryData, RegistryStore, StoreError, REG_BINARY, REG_DWORD, REG_EXPAND_SZ, REG_MULTI_SZ,
    REG_QWORD, REG_SZ,
};

const SIGNATURE: u32 = 0x6765_5250;
const VERSION: u32 = 1;

const MARKER_PREFIX: &str = "**";
const DELETE_PREFIX: &str = "**del.";
const CLEAR_MARKER: &str = "**delvals.";
const DELETE_VALUES_MARKER: &str = "**deletevalues";

#[derive(Debug, thiserror::Error)]
pub enum PolError {
    #[error("not a POL file (signature {0:#010x})")]
    BadSignature(u32),

    #[error("unsupported POL version {0}")]
    UnsupportedVersion(u32),

    #[error("POL data truncated at offset {0}")]
    Truncated(usize),

    #[error("malformed POL record at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    #[error("POL file I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PolEntry {
    key: String,
    name: String,
    data: RegistryData,
}

/// A parsed POL file. Entry order is preserved across load and save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolFile {
    entries: IndexMap<String, PolEntry>,
}

fn trim_key(key: &str) -> &str {
    key.trim_matches('\\')
}

fn key_prefix(key: &str) -> String {
    let mut prefix = trim_key(key).to_ascii_lowercase();
    prefix.push('\0');
    prefix
}

fn dict_key(key: &str, name: &str) -> String {
    let mut dict = key_prefix(key);
    dict.push_str(&name.to_ascii_lowercase());
    dict
}

fn marker_data() -> RegistryData {
    RegistryData::String(" ".into())
}

impl PolFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, markers included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All records in file order, markers included.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &RegistryData)> {
        self.entries
            .values()
            .map(|e| (e.key.as_str(), e.name.as_str(), &e.data))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Like `load`, but a missing file yields an empty store.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self, PolError> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PolError> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PolError> {
        let mut reader = Reader { bytes, pos: 0 };
        let signature = reader.u32()?;
        if signature != SIGNATURE {
            return Err(PolError::BadSignature(signature));
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(PolError::UnsupportedVersion(version));
        }

        let mut pol = Self::new();
        while !reader.at_end() {
            let start = reader.pos;
            reader.expect('[', start, "expected '['")?;
            let key = reader.utf16z()?;
            reader.expect(';', start, "expected ';' after key")?;
            let name = reader.utf16z()?;
            reader.expect(';', start, "expected ';' after value name")?;
            let kind = reader.u32()?;
            reader.expect(';', start, "expected ';' after type")?;
            let size = reader.u32()? as usize;
            reader.expect(';', start, "expected ';' after size")?;
            let raw = reader.take(size)?;
            reader.expect(']', start, "expected ']'")?;

            let data = decode_data(kind, raw, start)?;
            pol.insert_raw(&key, &name, data);
        }
        Ok(pol)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * 64);
        out.extend_from_slice(&SIGNATURE.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());

        for entry in self.entries.values() {
            let data = encode_data(&entry.data);
            push_char(&mut out, '[');
            push_utf16z(&mut out, &entry.key);
            push_char(&mut out, ';');
            push_utf16z(&mut out, &entry.name);
            push_char(&mut out, ';');
            out.extend_from_slice(&entry.data.kind().to_le_bytes());
            push_char(&mut out, ';');
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            push_char(&mut out, ';');
            out.extend_from_slice(&data);
            push_char(&mut out, ']');
        }
        out
    }

    fn insert_raw(&mut self, key: &str, name: &str, data: RegistryData) {
        let key = trim_key(key);
        match self.entries.get_mut(&dict_key(key, name)) {
            Some(existing) => {
                existing.key = key.to_string();
                existing.name = name.to_string();
                existing.data = data;
            }
            None => {
                self.entries.insert(
                    dict_key(key, name),
                    PolEntry {
                        key: key.to_string(),
                        name: name.to_string(),
                        data,
                    },
                );
            }
        }
    }

    /// Scan the records under `key`; later records override earlier ones.
    fn deletion_recorded(&self, key: &str, name: &str, honor_clear: bool) -> bool {
        let prefix = key_prefix(key);
        let name = name.to_ascii_lowercase();
        let delete_marker = format!("{DELETE_PREFIX}{name}");

        let mut deleted = false;
        for (dict, entry) in &self.entries {
            let Some(entry_name) = dict.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if entry_name == delete_marker || (honor_clear && entry_name == CLEAR_MARKER) {
                deleted = true;
            } else if entry_name.starts_with(DELETE_VALUES_MARKER) {
                let listed = entry.data.as_str().unwrap_or_default();
                if listed.split(';').any(|v| v.trim().eq_ignore_ascii_case(&name)) {
                    deleted = true;
                }
            } else if entry_name == name {
                deleted = false;
            }
        }
        deleted
    }

    fn remove_raw(&mut self, key: &str, name: &str) {
        self.entries.shift_remove(&dict_key(key, name));
    }
}

impl RegistryStore for PolFile {
    fn get_value(&self, key: &str, name: &str) -> Option<RegistryData> {
        self.entries
            .get(&dict_key(key, name))
            .map(|entry| entry.data.clone())
    }

    fn will_delete_value(&self, key: &str, name: &str) -> bool {
        self.deletion_recorded(key, name, true)
    }

    fn is_value_deleted(&self, key: &str, name: &str) -> bool {
        self.deletion_recorded(key, name, false)
    }

    fn is_key_cleared(&self, key: &str) -> bool {
        self.entries.contains_key(&dict_key(key, CLEAR_MARKER))
    }

    fn value_names(&self, key: &str) -> Vec<String> {
        let prefix = key_prefix(key);
        self.entries
            .iter()
            .filter(|(dict, _)| dict.starts_with(prefix.as_str()))
            .filter(|(_, entry)| !entry.name.starts_with(MARKER_PREFIX))
            .map(|(_, entry)| entry.name.clone())
            .collect()
    }

    fn set_value(&mut self, key: &str, name: &str, data: RegistryData) -> Result<(), StoreError> {
        self.remove_raw(key, &format!("{DELETE_PREFIX}{name}"));
        self.insert_raw(key, name, data);
        Ok(())
    }

    fn delete_value(&mut self, key: &str, name: &str) -> Result<(), StoreError> {
        self.remove_raw(key, name);
        self.insert_raw(key, &format!("{DELETE_PREFIX}{name}"), marker_data());
        Ok(())
    }

    fn forget_value(&mut self, key: &str, name: &str) -> Result<(), StoreError> {
        self.remove_raw(key, name);
        self.remove_raw(key, &format!("{DELETE_PREFIX}{name}"));
        Ok(())
    }

    fn clear_key(&mut self, key: &str) -> Result<(), StoreError> {
        let prefix = key_prefix(key);
        self.entries.retain(|dict, _| !dict.starts_with(prefix.as_str()));
        self.insert_raw(key, CLEAR_MARKER, marker_data());
        Ok(())
    }

    fn forget_key_clearance(&mut self, key: &str) -> Result<(), StoreError> {
        self.remove_raw(key, CLEAR_MARKER);
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PolError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(PolError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, PolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn expect(&mut self, c: char, offset: usize, reason: &'static str) -> Result<(), PolError> {
        if self.u16()? != c as u16 {
            return Err(PolError::Malformed { offset, reason });
        }
        Ok(())
    }

    fn utf16z(&mut self) -> Result<String, PolError> {
        let mut units = Vec::new();
        loop {
            match self.u16()? {
                0 => break,
                unit => units.push(unit),
            }
        }
        Ok(String::from_utf16_lossy(&units))
    }
}

fn utf16_units(raw: &[u8], offset: usize) -> Result<Vec<u16>, PolError> {
    if raw.len() % 2 != 0 {
        return Err(PolError::Malformed {
            offset,
            reason: "odd-length string data",
        });
    }
    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn decode_string(raw: &[u8], offset: usize) -> Result<String, PolError> {
    let mut units = utf16_units(raw, offset)?;
    while units.last() == Some(&0) {
        units.pop();
    }
    Ok(String::from_utf16_lossy(&units))
}

/// Each string is NUL-terminated and the list ends with one more NUL, so
/// empty strings keep their position: `["a", ""]` is `a\0\0\0`.
fn decode_multi_string(raw: &[u8], offset: usize) -> Result<Vec<String>, PolError> {
    let units = utf16_units(raw, offset)?;
    let mut body: &[u16] = &units;
    if body.last() == Some(&0) {
        body = &body[..body.len() - 1];
    }
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if body.last() == Some(&0) {
        body = &body[..body.len() - 1];
    }
    Ok(body
        .split(|unit| *unit == 0)
        .map(String::from_utf16_lossy)
        .collect())
}

fn decode_data(kind: u32, raw: &[u8], offset: usize) -> Result<RegistryData, PolError> {
    Ok(match kind {
        REG_SZ => RegistryData::String(decode_string(raw, offset)?),
        REG_EXPAND_SZ => RegistryData::ExpandString(decode_string(raw, offset)?),
        REG_BINARY => RegistryData::Binary(raw.to_vec()),
        REG_DWORD => {
            let bytes: [u8; 4] = raw.try_into().map_err(|_| PolError::Malformed {
                offset,
                reason: "REG_DWORD data is not 4 bytes",
            })?;
            RegistryData::DWord(u32::from_le_bytes(bytes))
        }
        REG_QWORD => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| PolError::Malformed {
                offset,
                reason: "REG_QWORD data is not 8 bytes",
            })?;
            RegistryData::QWord(u64::from_le_bytes(bytes))
        }
        REG_MULTI_SZ => RegistryData::MultiString(decode_multi_string(raw, offset)?),
        other => RegistryData::Other {
            kind: other,
            bytes: raw.to_vec(),
        },
    })
}

fn push_char(out: &mut Vec<u8>, c: char) {
    out.extend_from_slice(&(c as u16).to_le_bytes());
}

fn push_utf16(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

fn push_utf16z(out: &mut Vec<u8>, s: &str) {
    push_utf16(out, s);
    out.extend_from_slice(&[0, 0]);
}

fn encode_data(data: &RegistryData) -> Vec<u8> {
    let mut out = Vec::new();
    match data {
        RegistryData::String(s) | RegistryData::ExpandString(s) => push_utf16z(&mut out, s),
        RegistryData::MultiString(items) => {
            for item in items {
                push_utf16z(&mut out, item);
            }
            out.extend_from_slice(&[0, 0]);
        }
        RegistryData::DWord(n) => out.extend_from_slice(&n.to_le_bytes()),
        RegistryData::QWord(n) => out.extend_from_slice(&n.to_le_bytes()),
        RegistryData::Binary(bytes) | RegistryData::Other { bytes, .. } => {
            out.extend_from_slice(bytes)
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = r"Software\Policies\Vendor\Product";

    fn sample() -> PolFile {
        let mut pol = PolFile::new();
        pol.set_value(KEY, "Timeout", RegistryData::DWord(900)).unwrap();
        pol.set_value(KEY, "Greeting", RegistryData::String("héllo".into()))
            .unwrap();
        pol.set_value(KEY, "Path", RegistryData::ExpandString(r"%TEMP%\x".into()))
            .unwrap();
        pol.set_value(KEY, "Big", RegistryData::QWord(1 << 40)).unwrap();
        pol.set_value(
            KEY,
            "Servers",
            RegistryData::MultiString(vec!["a".into(), "".into(), "c".into()]),
        )
        .unwrap();
        pol.set_value(KEY, "Blob", RegistryData::Binary(vec![1, 2, 3]))
            .unwrap();
        pol.delete_value(KEY, "Legacy").unwrap();
        pol
    }

    #[test]
    fn bytes_round_trip_preserves_records_and_order() {
        let pol = sample();
        let bytes = pol.to_bytes();
        assert_eq!(&bytes[..4], b"PReg");

        let parsed = PolFile::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pol);
        let names: Vec<_> = parsed.entries().map(|(_, name, _)| name).collect();
        assert_eq!(
            names,
            vec!["Timeout", "Greeting", "Path", "Big", "Servers", "Blob", "**del.Legacy"]
        );
    }

    #[test]
    fn multi_string_keeps_empty_entries() {
        for items in [vec![], vec![String::new()], vec!["a".to_string(), String::new()]] {
            let data = RegistryData::MultiString(items.clone());
            let decoded = decode_data(REG_MULTI_SZ, &encode_data(&data), 0).unwrap();
            assert_eq!(decoded, data, "items {items:?}");
        }
    }

    #[test]
    fn rejects_foreign_and_truncated_data() {
        assert!(matches!(
            PolFile::from_bytes(b"NOPE\x01\x00\x00\x00"),
            Err(PolError::BadSignature(_))
        ));
        assert!(matches!(
            PolFile::from_bytes(b"PReg\x02\x00\x00\x00"),
            Err(PolError::UnsupportedVersion(2))
        ));

        let bytes = sample().to_bytes();
        let cut = &bytes[..bytes.len() - 3];
        assert!(PolFile::from_bytes(cut).is_err());
    }

    #[test]
    fn lookups_ignore_case_and_trailing_separators() {
        let pol = sample();
        assert_eq!(
            pol.get_value(r"SOFTWARE\policies\vendor\product\", "timeout"),
            Some(RegistryData::DWord(900))
        );
    }

    #[test]
    fn delete_markers_are_tracked_and_hidden() {
        let mut pol = sample();
        assert!(pol.will_delete_value(KEY, "legacy"));
        assert!(!pol.contains_value(KEY, "Legacy"));
        assert!(!pol.value_names(KEY).iter().any(|n| n.starts_with("**")));

        pol.set_value(KEY, "Legacy", RegistryData::DWord(1)).unwrap();
        assert!(!pol.will_delete_value(KEY, "Legacy"));

        pol.forget_value(KEY, "Legacy").unwrap();
        assert!(!pol.will_delete_value(KEY, "Legacy"));
        assert!(!pol.contains_value(KEY, "Legacy"));
    }

    #[test]
    fn clearing_a_key_marks_every_value_deleted() {
        let mut pol = sample();
        pol.clear_key(KEY).unwrap();

        assert!(pol.is_key_cleared(KEY));
        assert!(pol.value_names(KEY).is_empty());
        assert!(pol.will_delete_value(KEY, "Anything"));

        pol.set_value(KEY, "1", RegistryData::String("one".into()))
            .unwrap();
        assert!(!pol.will_delete_value(KEY, "1"));
        assert_eq!(pol.value_names(KEY), vec!["1".to_string()]);

        pol.forget_key_clearance(KEY).unwrap();
        assert!(!pol.is_key_cleared(KEY));
    }

    #[test]
    fn named_deletions_are_distinct_from_key_clears() {
        let mut pol = PolFile::new();
        pol.clear_key(KEY).unwrap();
        assert!(pol.will_delete_value(KEY, "Optional"));
        assert!(!pol.is_value_deleted(KEY, "Optional"));

        pol.delete_value(KEY, "Optional").unwrap();
        assert!(pol.is_value_deleted(KEY, "optional"));

        pol.set_value(KEY, "Optional", RegistryData::DWord(2)).unwrap();
        assert!(!pol.is_value_deleted(KEY, "Optional"));
    }

    #[test]
    fn case_folding_is_ascii_only() {
        let mut pol = PolFile::new();
        pol.set_value(KEY, "Ärger", RegistryData::DWord(1)).unwrap();
        assert!(pol.contains_value(&KEY.to_ascii_uppercase(), "ÄRGER"));
        assert!(!pol.contains_value(KEY, "ärger"));
    }

    #[test]
    fn delete_values_marker_lists_names() {
        let mut pol = PolFile::new();
        pol.insert_raw(KEY, "**DeleteValues", RegistryData::String("Alpha;Beta".into()));
        assert!(pol.will_delete_value(KEY, "beta"));
        assert!(!pol.will_delete_value(KEY, "Gamma"));
    }

    #[test]
    fn file_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Registry.pol");

        assert!(PolFile::load_or_empty(&path).unwrap().is_empty());

        let pol = sample();
        pol.save(&path).unwrap();
        assert_eq!(PolFile::load(&path).unwrap(), pol);
    }
}
