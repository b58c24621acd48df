//! Kernel event format descriptors and the database indexing them.
//!
//! Every event under `events/<system>/<event>/format` describes its own
//! binary layout (field name, offset, size, signedness, array kind). The
//! [`FormatDatabase`] loads and indexes those descriptors so the record
//! decoder and filter validation can resolve events by id or by name.

use crate::error::Error;
use crate::error::Result;
use crate::tracefs::TraceFs;
use compact_str::CompactString;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::collections::HashMap;

/// How a field's bytes are laid out inside the record payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Not an array. Example: `char val; size:1;`
    None,
    /// Fixed (see `size`). Example: `char val[16]; size:16;`
    Fixed,
    /// Example: `char val[]; size:0;`
    /// The rest of the record is the array.
    Trailing,
    /// Example: `__data_loc char[] val; size:4;`
    /// The upper half-word is length, the lower is the offset from the
    /// start of the record.
    DataLoc,
}

/// One field of an event's binary layout. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct FieldFormat {
    /// The C type of the field, e.g. `int`, `char[16]`, `__data_loc char[]`.
    pub ctype: CompactString,
    /// The field name, e.g. `prev_comm`, `next_pid`.
    pub name: CompactString,
    /// Offset in bytes from the start of the record.
    pub offset: u32,
    /// Size of the field in bytes.
    pub size: u32,
    /// Whether the field is signed (`int` vs `unsigned int`).
    pub signed: bool,
    pub array: ArrayKind,
}

impl FieldFormat {
    /// Whether the field decodes to text rather than raw bytes.
    pub fn is_string(&self) -> bool {
        self.array != ArrayKind::None && self.ctype.contains("char")
    }

    fn parse(line: &str) -> Result<Option<Self>> {
        if line.is_empty() {
            return Ok(None);
        }
        let parts: SmallVec<[&str; 4]> = line[1..].split('\t').collect();
        if parts.len() != 4 {
            return Err(Error::Format(format!(
                "field line has {} sections, expected 4",
                parts.len()
            )));
        }
        let mut ctype = None;
        let mut name = None;
        let mut offset = 0;
        let mut size = 0;
        let mut signed = false;
        for part in parts {
            let part = part.strip_suffix(';').unwrap_or(part);
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| Error::Format("field section without a colon".into()))?;
            match key {
                "field" => {
                    let last_space = value
                        .rfind(' ')
                        .ok_or_else(|| Error::Format("field declaration without a space".into()))?;
                    let declared_type = &value[0..last_space];
                    ctype = Some(Cow::Borrowed(declared_type));
                    let declared_name = &value[last_space + 1..];
                    name = Some(declared_name);
                    // A `[len]` suffix on the name belongs to the type.
                    if let Some(idx) = declared_name.rfind('[') {
                        ctype = Some(Cow::Owned(format!(
                            "{declared_type}{}",
                            &declared_name[idx..]
                        )));
                        name = Some(&declared_name[..idx]);
                    }
                }
                "offset" => {
                    offset = value
                        .parse::<u32>()
                        .map_err(|_| Error::Format(format!("bad offset value {value:?}")))?;
                }
                "size" => {
                    size = value
                        .parse::<u32>()
                        .map_err(|_| Error::Format(format!("bad size value {value:?}")))?;
                }
                "signed" => {
                    signed = match value {
                        "1" => true,
                        "0" => false,
                        _ => {
                            return Err(Error::Format(format!("bad signed value {value:?}")));
                        }
                    };
                }
                _ => {
                    return Err(Error::Format(format!("unknown field section {key:?}")));
                }
            }
        }

        let ctype: CompactString = ctype
            .ok_or_else(|| Error::Format("missing field type".into()))?
            .into();

        let array = if ctype.starts_with("__data_loc") && size == 4 {
            ArrayKind::DataLoc
        } else if ctype.ends_with("[]") && size == 0 {
            ArrayKind::Trailing
        } else if FIXED_REGEX.is_match(&ctype) {
            ArrayKind::Fixed
        } else {
            ArrayKind::None
        };

        Ok(Some(Self {
            ctype,
            name: name
                .ok_or_else(|| Error::Format("missing field name".into()))?
                .into(),
            offset,
            size,
            signed,
            array,
        }))
    }
}

static FIXED_REGEX: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"\[[0-9]+\]$").expect("Failed to compile regex")
});

/// A kernel event format descriptor: `(system, name, id)` plus the ordered
/// field layout. Immutable once loaded; owned by the [`FormatDatabase`].
#[derive(Debug, Clone)]
pub struct EventFormat {
    pub system: CompactString,
    pub name: CompactString,
    /// The numeric id embedded in every record of this event.
    pub id: u32,
    /// The print format string the kernel would use for text output.
    pub print_fmt: String,
    /// Fields in declaration order, common header fields first.
    pub fields: Vec<FieldFormat>,
}

impl EventFormat {
    /// Parse the text of an `events/<system>/<event>/format` file.
    pub fn parse(system: &str, text: &str) -> Result<Self> {
        #[derive(PartialEq, Eq)]
        enum Mode {
            Normal,
            Format,
        }

        let mut mode = Mode::Normal;
        let mut fields = Vec::new();
        let mut name = CompactString::default();
        let mut id = 0;
        let mut print_fmt = String::new();

        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            if mode == Mode::Format {
                if line.as_bytes()[0] == b'\t' {
                    if let Some(field) = FieldFormat::parse(line)? {
                        fields.push(field);
                    }
                    continue;
                }
                mode = Mode::Normal; // End of format section
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Format("descriptor line without a colon".into()))?;
            let value = value.strip_prefix(' ').unwrap_or(value);
            match key {
                "name" => {
                    name.push_str(value);
                }
                "ID" => {
                    id = value
                        .parse::<u32>()
                        .map_err(|_| Error::Format(format!("bad ID value {value:?}")))?;
                }
                "format" => {
                    mode = Mode::Format;
                    continue;
                }
                "print fmt" => {
                    print_fmt.push_str(value);
                }
                _ => {
                    return Err(Error::Format(format!("unknown descriptor key {key:?}")));
                }
            }
        }
        Ok(Self {
            system: system.into(),
            name,
            id,
            print_fmt,
            fields,
        })
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldFormat> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

/// Loaded event format descriptors, indexed by id and by `(system, name)`.
#[derive(Debug, Default)]
pub struct FormatDatabase {
    events: Vec<EventFormat>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<(CompactString, CompactString), usize>,
    systems: BTreeSet<CompactString>,
}

impl FormatDatabase {
    /// Scan `events/` under the given instance (the top-level instance when
    /// `None`) and index every readable format descriptor.
    ///
    /// Non-event entries (`enable`, `header_page`, ...) are skipped; a
    /// descriptor that exists but does not parse is an error.
    pub fn load<F: TraceFs>(fs: &F, instance: Option<&str>) -> Result<Self> {
        let mut db = Self::default();
        let systems = fs.list_dir(instance, "events")?;
        for system in &systems {
            let Ok(events) = fs.list_dir(instance, &format!("events/{system}")) else {
                continue; // A plain control file, not a system directory.
            };
            for event in &events {
                let path = format!("events/{system}/{event}/format");
                if !fs.exists(instance, &path) {
                    continue;
                }
                let text = fs.read(instance, &path)?;
                db.insert(EventFormat::parse(system, &text)?);
            }
        }
        log::debug!(
            "loaded {} event formats across {} systems",
            db.events.len(),
            db.systems.len()
        );
        Ok(db)
    }

    fn insert(&mut self, format: EventFormat) {
        let index = self.events.len();
        self.systems.insert(format.system.clone());
        self.by_id.insert(format.id, index);
        self.by_name
            .insert((format.system.clone(), format.name.clone()), index);
        self.events.push(format);
    }

    /// Resolve the descriptor for a record's embedded event id.
    pub fn by_id(&self, id: u32) -> Option<&EventFormat> {
        self.by_id.get(&id).map(|&index| &self.events[index])
    }

    pub fn get(&self, system: &str, event: &str) -> Option<&EventFormat> {
        let key = (CompactString::from(system), CompactString::from(event));
        self.by_name.get(&key).map(|&index| &self.events[index])
    }

    pub fn has_system(&self, system: &str) -> bool {
        self.systems.contains(system)
    }

    /// All known systems, sorted.
    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.systems.iter().map(CompactString::as_str)
    }

    /// All events of one system, in load order.
    pub fn events_in(&self, system: &str) -> impl Iterator<Item = &EventFormat> {
        self.events
            .iter()
            .filter(move |format| format.system == system)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventFormat> {
        self.events.iter()
    }
}
