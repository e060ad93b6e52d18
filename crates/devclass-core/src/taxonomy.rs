//! Device class taxonomy loaded from an XML descriptor
//!
//! The descriptor lists device classes as flat elements, each carrying a
//! `key`, a `label` and optionally the `command_classes` the class mandates
//! and the command class its Basic set maps to:
//!
//! ```xml
//! <DeviceClasses>
//!     <Basic key="0x04" label="Routing Slave" />
//!     <Generic key="0x10" label="Binary Switch" command_classes="0x20,0x25" basic="0x25">
//!         <Specific key="0x01" label="Binary Power Switch" command_classes="0x27" />
//!     </Generic>
//!     <Role key="0x05" label="Always On Slave" />
//!     <NodeType key="0x00" label="Z-Wave+ Node" />
//!     <DeviceType key="0x0700" label="On/Off Power Switch" />
//! </DeviceClasses>
//! ```
//!
//! A `Generic` element opens a scope: every `Specific` that follows belongs to
//! it until the next `Generic` or the end of the document. Nesting is not
//! required.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Descriptor compiled into the crate
pub const BUNDLED_DESCRIPTOR: &str = include_str!("../data/device_classes.xml");

/// Root element name, accepted without a record
const ROOT_ELEMENT: &str = "DeviceClasses";

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Failed to parse descriptor at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("<{element}> is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("<{element}> attribute '{attribute}' is not a valid number: '{value}'")]
    InvalidNumber {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },
}

/// Element kinds that produce records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Basic,
    Generic,
    Specific,
    Role,
    NodeType,
    DeviceType,
}

impl ElementKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Basic" => Some(Self::Basic),
            "Generic" => Some(Self::Generic),
            "Specific" => Some(Self::Specific),
            "Role" => Some(Self::Role),
            "NodeType" => Some(Self::NodeType),
            "DeviceType" => Some(Self::DeviceType),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Generic => "Generic",
            Self::Specific => "Specific",
            Self::Role => "Role",
            Self::NodeType => "NodeType",
            Self::DeviceType => "DeviceType",
        }
    }
}

/// One device class entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub key: u16,
    pub label: String,
    /// Command classes mandated by this class
    #[serde(default)]
    pub command_classes: Vec<u8>,
    /// Command class the Basic command set maps to
    #[serde(default)]
    pub basic: Option<u8>,
}

/// A generic device class and the specific classes scoped under it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericClass {
    pub record: ClassRecord,
    #[serde(default)]
    pub specifics: BTreeMap<u16, ClassRecord>,
}

impl GenericClass {
    pub fn specific(&self, key: u16) -> Option<&ClassRecord> {
        self.specifics.get(&key)
    }
}

/// Record counts per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaxonomySummary {
    pub basic: usize,
    pub generic: usize,
    pub specific: usize,
    pub role: usize,
    pub node_type: usize,
    pub device_type: usize,
}

/// Lookup tables built from a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTaxonomy {
    pub basic: BTreeMap<u16, ClassRecord>,
    pub generic: BTreeMap<u16, GenericClass>,
    pub role: BTreeMap<u16, ClassRecord>,
    pub node_type: BTreeMap<u16, ClassRecord>,
    pub device_type: BTreeMap<u16, ClassRecord>,
}

impl DeviceTaxonomy {
    /// Parse the descriptor bundled with the crate
    pub fn bundled() -> Result<Self, TaxonomyError> {
        Self::from_xml(BUNDLED_DESCRIPTOR)
    }

    /// Parse a descriptor file
    pub fn from_file(path: &Path) -> Result<Self, TaxonomyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_xml(&content)
    }

    /// Parse a descriptor from an XML string
    pub fn from_xml(xml: &str) -> Result<Self, TaxonomyError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut builder = TaxonomyBuilder::default();
        loop {
            let position = reader.buffer_position() as u64;
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => builder.element(&e, position)?,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(source) => return Err(TaxonomyError::Xml { position, source }),
            }
        }

        let taxonomy = builder.finish();
        debug!(summary = ?taxonomy.summary(), "Loaded device taxonomy");
        Ok(taxonomy)
    }

    pub fn basic(&self, key: u16) -> Option<&ClassRecord> {
        self.basic.get(&key)
    }

    pub fn generic(&self, key: u16) -> Option<&GenericClass> {
        self.generic.get(&key)
    }

    pub fn specific(&self, generic: u16, specific: u16) -> Option<&ClassRecord> {
        self.generic(generic).and_then(|g| g.specific(specific))
    }

    pub fn role(&self, key: u16) -> Option<&ClassRecord> {
        self.role.get(&key)
    }

    pub fn node_type(&self, key: u16) -> Option<&ClassRecord> {
        self.node_type.get(&key)
    }

    pub fn device_type(&self, key: u16) -> Option<&ClassRecord> {
        self.device_type.get(&key)
    }

    /// Most precise label known for a generic/specific pair.
    ///
    /// Falls back to the generic label when the specific class is unknown.
    pub fn describe(&self, generic: u16, specific: Option<u16>) -> Option<&str> {
        let g = self.generic(generic)?;
        let label = specific
            .and_then(|s| g.specific(s))
            .map(|s| s.label.as_str())
            .unwrap_or(g.record.label.as_str());
        Some(label)
    }

    pub fn summary(&self) -> TaxonomySummary {
        TaxonomySummary {
            basic: self.basic.len(),
            generic: self.generic.len(),
            specific: self.generic.values().map(|g| g.specifics.len()).sum(),
            role: self.role.len(),
            node_type: self.node_type.len(),
            device_type: self.device_type.len(),
        }
    }
}

#[derive(Default)]
struct TaxonomyBuilder {
    taxonomy: DeviceTaxonomy,
    /// Key of the Generic whose scope is open
    current_generic: Option<u16>,
}

impl TaxonomyBuilder {
    fn element(&mut self, e: &BytesStart<'_>, position: u64) -> Result<(), TaxonomyError> {
        let local = e.local_name();
        let name = String::from_utf8_lossy(local.as_ref());

        let kind = match ElementKind::from_name(&name) {
            Some(kind) => kind,
            None => {
                if name != ROOT_ELEMENT {
                    warn!(element = %name, position, "Ignoring unknown descriptor element");
                }
                return Ok(());
            }
        };

        let record = read_record(e, kind, position)?;
        match kind {
            ElementKind::Basic => insert(&mut self.taxonomy.basic, kind, record),
            ElementKind::Role => insert(&mut self.taxonomy.role, kind, record),
            ElementKind::NodeType => insert(&mut self.taxonomy.node_type, kind, record),
            ElementKind::DeviceType => insert(&mut self.taxonomy.device_type, kind, record),
            ElementKind::Generic => {
                self.current_generic = Some(record.key);
                let generic = GenericClass {
                    record,
                    specifics: BTreeMap::new(),
                };
                if let Some(old) = self.taxonomy.generic.insert(generic.record.key, generic) {
                    debug!(key = old.record.key, "Duplicate Generic replaces earlier entry");
                }
            }
            ElementKind::Specific => {
                let generic = self
                    .current_generic
                    .and_then(|key| self.taxonomy.generic.get_mut(&key));
                match generic {
                    Some(generic) => insert(&mut generic.specifics, kind, record),
                    None => warn!(
                        key = record.key,
                        label = %record.label,
                        position,
                        "Ignoring Specific outside of any Generic"
                    ),
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> DeviceTaxonomy {
        self.taxonomy
    }
}

fn insert(table: &mut BTreeMap<u16, ClassRecord>, kind: ElementKind, record: ClassRecord) {
    if let Some(old) = table.insert(record.key, record) {
        debug!(element = kind.name(), key = old.key, "Duplicate key replaces earlier entry");
    }
}

fn read_record(e: &BytesStart<'_>, kind: ElementKind, position: u64) -> Result<ClassRecord, TaxonomyError> {
    let element = kind.name();

    let key = required_attr(e, kind, "key", position)?;
    let label = required_attr(e, kind, "label", position)?;

    let key = parse_number(&key).ok_or(TaxonomyError::InvalidNumber {
        element,
        attribute: "key",
        value: key.clone(),
    })?;

    let command_classes = match attr(e, "command_classes", position)? {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                parse_byte(s).ok_or_else(|| TaxonomyError::InvalidNumber {
                    element,
                    attribute: "command_classes",
                    value: s.to_string(),
                })
            })
            .collect::<Result<Vec<u8>, _>>()?,
        None => Vec::new(),
    };

    let basic = match attr(e, "basic", position)? {
        Some(value) => Some(parse_byte(&value).ok_or(TaxonomyError::InvalidNumber {
            element,
            attribute: "basic",
            value: value.clone(),
        })?),
        None => None,
    };

    Ok(ClassRecord {
        key,
        label,
        command_classes,
        basic,
    })
}

fn attr(e: &BytesStart<'_>, name: &str, position: u64) -> Result<Option<String>, TaxonomyError> {
    let xml_err = |source: quick_xml::Error| TaxonomyError::Xml { position, source };

    let attribute = e
        .try_get_attribute(name)
        .map_err(|err| xml_err(err.into()))?;
    match attribute {
        Some(a) => Ok(Some(a.unescape_value().map_err(xml_err)?.into_owned())),
        None => Ok(None),
    }
}

fn required_attr(
    e: &BytesStart<'_>,
    kind: ElementKind,
    name: &'static str,
    position: u64,
) -> Result<String, TaxonomyError> {
    attr(e, name, position)?.ok_or(TaxonomyError::MissingAttribute {
        element: kind.name(),
        attribute: name,
    })
}

/// Parse `0x`-prefixed hex or plain decimal
pub fn parse_number(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_byte(s: &str) -> Option<u8> {
    parse_number(s).and_then(|n| u8::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bundled() {
        let taxonomy = DeviceTaxonomy::bundled().unwrap();
        let summary = taxonomy.summary();
        assert_eq!(summary.basic, 4);
        assert_eq!(summary.generic, 26);
        assert_eq!(summary.specific, 85);
        assert_eq!(summary.role, 8);
        assert_eq!(summary.node_type, 2);
        assert_eq!(summary.device_type, 35);

        let switch = taxonomy.generic(0x10).unwrap();
        assert_eq!(switch.record.label, "Binary Switch");
        assert_eq!(switch.record.command_classes, vec![0x20, 0x25]);
        assert_eq!(switch.record.basic, Some(0x25));
        assert_eq!(
            taxonomy.specific(0x10, 0x01).map(|s| s.label.as_str()),
            Some("Binary Power Switch")
        );
        assert_eq!(taxonomy.device_type(0x0700).unwrap().label, "On/Off Power Switch");
        assert!(taxonomy.generic(0xff).unwrap().specifics.is_empty());
    }

    #[test]
    fn test_generic_scope_is_flat() {
        // Specifics attach to the most recent Generic even without nesting
        let xml = r#"<DeviceClasses>
            <Generic key="0x10" label="Binary Switch" />
            <Specific key="0x01" label="Binary Power Switch" />
            <Specific key="0x03" label="Binary Scene Switch" />
            <Generic key="0x11" label="Multilevel Switch" />
            <Specific key="0x01" label="Multilevel Power Switch" />
        </DeviceClasses>"#;

        let taxonomy = DeviceTaxonomy::from_xml(xml).unwrap();
        assert_eq!(taxonomy.generic(0x10).unwrap().specifics.len(), 2);
        assert_eq!(taxonomy.generic(0x11).unwrap().specifics.len(), 1);
        assert_eq!(
            taxonomy.specific(0x11, 0x01).unwrap().label,
            "Multilevel Power Switch"
        );
    }

    #[test]
    fn test_specific_without_generic_ignored() {
        let xml = r#"<DeviceClasses>
            <Specific key="0x01" label="Orphan" />
            <Basic key="0x01" label="Controller" />
        </DeviceClasses>"#;

        let taxonomy = DeviceTaxonomy::from_xml(xml).unwrap();
        assert_eq!(taxonomy.summary().specific, 0);
        assert_eq!(taxonomy.basic(0x01).unwrap().label, "Controller");
    }

    #[test]
    fn test_unknown_elements_ignored() {
        let xml = r#"<DeviceClasses>
            <Vendor key="0x0086" label="Aeotec" />
            <Role key="0x05" label="Always On Slave" command_classes="0x5e, 0x86" />
        </DeviceClasses>"#;

        let taxonomy = DeviceTaxonomy::from_xml(xml).unwrap();
        assert_eq!(taxonomy.role(0x05).unwrap().command_classes, vec![0x5e, 0x86]);
        assert_eq!(taxonomy.summary().role, 1);
    }

    #[test]
    fn test_missing_attribute() {
        let xml = r#"<DeviceClasses><Basic key="0x01" /></DeviceClasses>"#;
        let err = DeviceTaxonomy::from_xml(xml).unwrap_err();
        assert!(matches!(
            err,
            TaxonomyError::MissingAttribute { element: "Basic", attribute: "label" }
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        let xml = r#"<DeviceClasses><NodeType key="zz" label="Bad" /></DeviceClasses>"#;
        assert!(matches!(
            DeviceTaxonomy::from_xml(xml).unwrap_err(),
            TaxonomyError::InvalidNumber { attribute: "key", .. }
        ));

        let xml = r#"<DeviceClasses><Generic key="0x10" label="Switch" basic="0x125" /></DeviceClasses>"#;
        assert!(matches!(
            DeviceTaxonomy::from_xml(xml).unwrap_err(),
            TaxonomyError::InvalidNumber { attribute: "basic", .. }
        ));
    }

    #[test]
    fn test_malformed_xml() {
        let xml = r#"<DeviceClasses><Basic key="0x01" label="Controller"></DeviceClasses>"#;
        assert!(matches!(
            DeviceTaxonomy::from_xml(xml).unwrap_err(),
            TaxonomyError::Xml { .. }
        ));
    }

    #[test]
    fn test_describe() {
        let taxonomy = DeviceTaxonomy::bundled().unwrap();
        assert_eq!(taxonomy.describe(0x40, Some(0x03)), Some("Secure Keypad Door Lock"));
        assert_eq!(taxonomy.describe(0x40, Some(0x7f)), Some("Entry Control"));
        assert_eq!(taxonomy.describe(0x40, None), Some("Entry Control"));
        assert_eq!(taxonomy.describe(0x99, None), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x0c07"), Some(0x0c07));
        assert_eq!(parse_number("0XFF"), Some(0xff));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_byte("0x100"), None);
    }
}
