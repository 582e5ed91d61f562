use std::fmt;
use std::str::FromStr;

/// One row of the master list.
///
/// `index` is the position in the master list and is the unit of checkpoint
/// progress. `external_id` is only used to build the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub index: usize,
    pub external_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn empty_for(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Links(_) => FieldValue::List(Vec::new()),
            _ => FieldValue::Text(String::new()),
        }
    }

    pub fn encode(&self, encoding: ListEncoding) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => match encoding {
                ListEncoding::Joined(sep) => {
                    let mut buf = [0u8; 4];
                    let sep: &str = sep.encode_utf8(&mut buf);
                    items.join(sep)
                }
                // A Vec<String> always serializes.
                ListEncoding::Json => serde_json::to_string(items).unwrap_or_default(),
            },
        }
    }
}

/// Fixed-schema output for one successfully parsed job.
/// `values` line up with `RecordSchema::fields()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub name: String,
    pub values: Vec<FieldValue>,
}

impl Record {
    pub fn to_row(&self, encoding: ListEncoding) -> Vec<String> {
        let mut row = Vec::with_capacity(self.values.len() + 2);
        row.push(self.id.clone());
        row.push(self.name.clone());
        row.extend(self.values.iter().map(|v| v.encode(encoding)));
        row
    }
}

/// How a schema field is pulled out of an `<item>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Attribute on the item element itself.
    ItemAttr(&'static str),
    /// `value` attribute of the first element matching the selector.
    Value(&'static str),
    /// `value` of every `<link>` with this `type`, in document order.
    Links(&'static str),
    /// Entity-decoded text of the first element matching the selector.
    Text(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

const DETAIL_FIELDS: &[FieldSpec] = &[
    field("type", FieldKind::ItemAttr("type")),
    field("category", FieldKind::Links("boardgamecategory")),
    field("mechanism", FieldKind::Links("boardgamemechanic")),
    field("designer", FieldKind::Links("boardgamedesigner")),
    field("artist", FieldKind::Links("boardgameartist")),
    field("publisher", FieldKind::Links("boardgamepublisher")),
    field("min_players", FieldKind::Value("minplayers")),
    field("max_players", FieldKind::Value("maxplayers")),
    field("playing_time", FieldKind::Value("playingtime")),
    field("min_age", FieldKind::Value("minage")),
    field("complexity_rating", FieldKind::Value("statistics averageweight")),
    field("integrates_with", FieldKind::Links("boardgameintegration")),
];

const DESCRIPTION_FIELDS: &[FieldSpec] = &[field("description", FieldKind::Text("description"))];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSchema {
    Details,
    Description,
}

impl RecordSchema {
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            RecordSchema::Details => DETAIL_FIELDS,
            RecordSchema::Description => DESCRIPTION_FIELDS,
        }
    }

    /// `id,name,<schema fields...>`
    pub fn header(&self) -> Vec<&'static str> {
        let mut header = vec!["id", "name"];
        header.extend(self.fields().iter().map(|f| f.name));
        header
    }
}

/// Storage encoding for list-valued fields.
///
/// `Joined` is lossy when a value contains the separator; `Json` writes a
/// JSON array per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEncoding {
    Joined(char),
    Json,
}

impl Default for ListEncoding {
    fn default() -> Self {
        ListEncoding::Joined('|')
    }
}

impl fmt::Display for ListEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListEncoding::Joined(sep) => write!(f, "joined:{sep}"),
            ListEncoding::Json => f.write_str("json"),
        }
    }
}

impl FromStr for ListEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ListEncoding::Json),
            "joined" => Ok(ListEncoding::default()),
            other => {
                let sep = other
                    .strip_prefix("joined:")
                    .ok_or_else(|| format!("unknown list encoding '{other}'"))?;
                let mut chars = sep.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(ListEncoding::Joined(c)),
                    _ => Err(format!("separator must be one character, got '{sep}'")),
                }
            }
        }
    }
}
