//! Item model: bibliographic records, notes, attachments and annotations.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use super::remote;
use super::{ItemChanges, LibraryIdentifier, ObjectType, SyncMeta, Syncable};

pub const ATTACHMENT_TYPE: &str = "attachment";
pub const NOTE_TYPE: &str = "note";
pub const ANNOTATION_TYPE: &str = "annotation";

/// Remote keys that are not item fields.
const RESERVED_FIELDS: &[&str] = &["dateAdded", "dateModified", "mtime", "linkMode"];

static DATE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?P<year>\d{4})(?:[-/.](?P<month>\d{1,2})(?:[-/.](?P<day>\d{1,2}))?)?").ok()
});

static MARKUP_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

/// One field value with its own pending-edit flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemField {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub creator_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Single-field name for institutional creators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Creator {
    fn summary_name(&self) -> Option<&str> {
        self.last_name
            .as_deref()
            .or(self.name.as_deref())
            .or(self.first_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "tag")]
    pub name: String,
    /// 0 for manual tags, 1 for automatic ones.
    #[serde(rename = "type", default)]
    pub kind: i64,
}

/// File-related state of an attachment item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentState {
    pub content_type: Option<String>,
    pub filename: Option<String>,
    /// SHA-256 of the file contents (hex).
    pub content_hash: Option<String>,
    pub size: Option<u64>,
    pub has_local_file: bool,
    pub needs_upload: bool,
}

/// Values computed from the other parts after every merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub display_title: String,
    pub sort_title: String,
    pub creator_summary: Option<String>,
    /// `YYYY-MM-DD` with `00` for unknown parts.
    pub parsed_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemData {
    pub item_type: String,
    pub fields: Vec<ItemField>,
    pub creators: Vec<Creator>,
    pub tags: Vec<Tag>,
    pub collections: BTreeSet<String>,
    pub parent_key: Option<String>,
    pub trash: bool,
    pub relations: BTreeMap<String, Vec<String>>,
    pub attachment: Option<AttachmentState>,
    /// Annotation position payload.
    pub geometry: Option<String>,
    pub derived: DerivedFields,
}

impl ItemData {
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| field.value.as_str())
    }

    /// Recomputes title, sort key, creator summary and parsed date.
    pub fn recompute_derived(&mut self) {
        let title = match self.item_type.as_str() {
            NOTE_TYPE => self.field("note").map(note_title),
            ANNOTATION_TYPE => self
                .field("annotationText")
                .or_else(|| self.field("annotationComment"))
                .map(str::to_string),
            _ => self.field("title").map(str::to_string),
        }
        .unwrap_or_default();

        let creator_summary = creator_summary(&self.creators);
        let parsed_date = self.field("date").and_then(parse_date);

        self.derived = DerivedFields {
            sort_title: sort_title(&title),
            display_title: title,
            creator_summary,
            parsed_date,
        };
    }
}

/// A bibliographic item or one of its child objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub library: LibraryIdentifier,
    pub meta: SyncMeta,
    pub data: ItemData,
}

/// Item as returned by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub key: String,
    pub version: i64,
    pub item_type: String,
    #[serde(default, deserialize_with = "remote::optional_key")]
    pub parent_item: Option<String>,
    #[serde(default)]
    pub creators: Vec<Creator>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default, deserialize_with = "remote::relations")]
    pub relations: BTreeMap<String, Vec<String>>,
    #[serde(default, deserialize_with = "remote::truthy")]
    pub deleted: bool,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub annotation_position: Option<String>,
    /// Every other scalar value is an item field.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl RemoteItem {
    fn field_values(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .filter_map(|(key, value)| {
                let text = match value {
                    Value::String(text) => text.clone(),
                    Value::Number(number) => number.to_string(),
                    Value::Bool(flag) => flag.to_string(),
                    _ => return None,
                };
                Some((key.clone(), text))
            })
            .filter(|(_, value)| !value.is_empty())
            .collect()
    }
}

impl Item {
    /// An item created locally by the user.
    #[must_use]
    pub fn new_local(
        library: LibraryIdentifier,
        key: String,
        item_type: impl Into<String>,
        fields: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut data = ItemData {
            item_type: item_type.into(),
            fields: fields
                .into_iter()
                .map(|(key, value)| ItemField {
                    key,
                    value,
                    changed: true,
                })
                .collect(),
            ..ItemData::default()
        };
        data.recompute_derived();
        Self {
            key,
            library,
            meta: SyncMeta::new_local(ItemChanges::all().bits()),
            data,
        }
    }

    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.data.item_type == ATTACHMENT_TYPE
    }

    /// Sets a field value and flags it for the next push.
    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.data.fields.iter_mut().find(|field| field.key == key) {
            Some(field) if field.value == value => return,
            Some(field) => {
                field.value = value;
                field.changed = true;
            }
            None => self.data.fields.push(ItemField {
                key: key.to_string(),
                value,
                changed: true,
            }),
        }
        self.data.recompute_derived();
        self.mark_dirty(ItemChanges::FIELDS, super::ChangeType::User);
    }

    fn merge_fields(&mut self, remote: &RemoteItem) -> bool {
        let incoming = remote.field_values();
        let mut differed = false;

        let before = self.data.fields.len();
        self.data
            .fields
            .retain(|field| incoming.iter().any(|(key, _)| key == &field.key));
        differed |= before != self.data.fields.len();

        for (key, value) in incoming {
            match self.data.fields.iter_mut().find(|field| field.key == key) {
                Some(field) => {
                    if field.value != value {
                        field.value = value;
                        differed = true;
                    }
                    field.changed = false;
                }
                None => {
                    self.data.fields.push(ItemField {
                        key,
                        value,
                        changed: false,
                    });
                    differed = true;
                }
            }
        }
        differed
    }

    fn merge_attachment(&mut self, remote: &RemoteItem) -> bool {
        if remote.item_type != ATTACHMENT_TYPE {
            return self.data.attachment.take().is_some();
        }

        let state = self.data.attachment.get_or_insert_with(AttachmentState::default);
        let before = state.clone();
        state.content_type.clone_from(&remote.content_type);
        state.filename.clone_from(&remote.filename);
        if remote.content_hash.is_some() && state.content_hash != remote.content_hash {
            state.content_hash.clone_from(&remote.content_hash);
            state.has_local_file = false;
        }
        *state != before
    }
}

impl Syncable for Item {
    type Changes = ItemChanges;
    type Data = ItemData;
    type Remote = RemoteItem;

    const OBJECT_TYPE: ObjectType = ObjectType::Item;

    fn from_parts(key: String, library: LibraryIdentifier, meta: SyncMeta, data: ItemData) -> Self {
        Self {
            key,
            library,
            meta,
            data,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn library(&self) -> LibraryIdentifier {
        self.library
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn data(&self) -> &ItemData {
        &self.data
    }

    fn parent_key(&self) -> Option<&str> {
        self.data.parent_key.as_deref()
    }

    fn remote_key(remote: &RemoteItem) -> &str {
        &remote.key
    }

    fn remote_version(remote: &RemoteItem) -> i64 {
        remote.version
    }

    fn sync_from(&mut self, remote: &RemoteItem) -> ItemChanges {
        let mut changed = ItemChanges::empty();

        if self.data.item_type != remote.item_type {
            self.data.item_type.clone_from(&remote.item_type);
            changed |= ItemChanges::TYPE;
        }
        let fields_differed = self.merge_fields(remote);
        let attachment_differed = self.merge_attachment(remote);
        if fields_differed || attachment_differed {
            changed |= ItemChanges::FIELDS;
        }
        if self.data.creators != remote.creators {
            self.data.creators.clone_from(&remote.creators);
            changed |= ItemChanges::CREATORS;
        }

        let mut tags = remote.tags.clone();
        tags.sort();
        tags.dedup();
        if self.data.tags != tags {
            self.data.tags = tags;
            changed |= ItemChanges::TAGS;
        }

        let collections: BTreeSet<String> = remote.collections.iter().cloned().collect();
        if self.data.collections != collections {
            self.data.collections = collections;
            changed |= ItemChanges::COLLECTIONS;
        }
        if self.data.parent_key != remote.parent_item {
            self.data.parent_key.clone_from(&remote.parent_item);
            changed |= ItemChanges::PARENT;
        }
        if self.data.trash != remote.deleted {
            self.data.trash = remote.deleted;
            changed |= ItemChanges::TRASH;
        }
        if self.data.relations != remote.relations {
            self.data.relations.clone_from(&remote.relations);
            changed |= ItemChanges::RELATIONS;
        }
        if self.data.geometry != remote.annotation_position {
            self.data.geometry.clone_from(&remote.annotation_position);
            changed |= ItemChanges::GEOMETRY;
        }

        self.data.recompute_derived();
        changed
    }

    fn update_fields(&self, changes: ItemChanges, params: &mut Map<String, Value>) {
        let data = &self.data;
        let everything = changes == ItemChanges::all();

        if changes.contains(ItemChanges::TYPE) {
            params.insert("itemType".to_string(), Value::from(data.item_type.clone()));
        }
        if changes.contains(ItemChanges::FIELDS) {
            for field in &data.fields {
                if everything || field.changed {
                    params.insert(field.key.clone(), Value::from(field.value.clone()));
                }
            }
            if let Some(attachment) = &data.attachment {
                if let Some(content_type) = &attachment.content_type {
                    params.insert("contentType".to_string(), Value::from(content_type.clone()));
                }
                if let Some(filename) = &attachment.filename {
                    params.insert("filename".to_string(), Value::from(filename.clone()));
                }
            }
        }
        if changes.contains(ItemChanges::CREATORS) {
            let creators = serde_json::to_value(&data.creators).unwrap_or_default();
            params.insert("creators".to_string(), creators);
        }
        if changes.contains(ItemChanges::TAGS) {
            let tags = serde_json::to_value(&data.tags).unwrap_or_default();
            params.insert("tags".to_string(), tags);
        }
        if changes.contains(ItemChanges::COLLECTIONS) {
            let collections: Vec<Value> = data.collections.iter().cloned().map(Value::from).collect();
            params.insert("collections".to_string(), Value::Array(collections));
        }
        if changes.contains(ItemChanges::PARENT) {
            if let Some(parent) = &data.parent_key {
                params.insert("parentItem".to_string(), Value::from(parent.clone()));
            } else if !everything {
                params.insert("parentItem".to_string(), Value::Bool(false));
            }
        }
        if changes.contains(ItemChanges::TRASH) {
            params.insert("deleted".to_string(), Value::Bool(data.trash));
        }
        if changes.contains(ItemChanges::RELATIONS) {
            params.insert(
                "relations".to_string(),
                remote::relations_value(&data.relations),
            );
        }
        if changes.contains(ItemChanges::GEOMETRY) {
            if let Some(geometry) = &data.geometry {
                params.insert("annotationPosition".to_string(), Value::from(geometry.clone()));
            }
        }
    }

    fn clear_pushed(&mut self, pushed: ItemChanges) {
        if pushed.contains(ItemChanges::FIELDS) {
            for field in &mut self.data.fields {
                field.changed = false;
            }
        }
    }
}

fn note_title(note: &str) -> String {
    let plain = MARKUP_PATTERN
        .as_ref()
        .map_or_else(|| note.to_string(), |pattern| pattern.replace_all(note, "\n").into_owned());
    plain
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn sort_title(title: &str) -> String {
    let lowered = title
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    for article in ["the ", "a ", "an "] {
        if let Some(rest) = lowered.strip_prefix(article) {
            return rest.trim_start().to_string();
        }
    }
    lowered
}

fn creator_summary(creators: &[Creator]) -> Option<String> {
    let names: Vec<&str> = creators.iter().filter_map(Creator::summary_name).collect();
    match names.as_slice() {
        [] => None,
        [only] => Some((*only).to_string()),
        [first, second] => Some(format!("{first} and {second}")),
        [first, ..] => Some(format!("{first} et al.")),
    }
}

/// Extracts a sortable date from free-form date text.
fn parse_date(text: &str) -> Option<String> {
    let captures = DATE_PATTERN.as_ref()?.captures(text)?;
    let year = captures.name("year")?.as_str();
    let part = |name: &str| {
        captures
            .name(name)
            .and_then(|value| value.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    let (month, day) = (part("month"), part("day"));
    let (month, day) = if (1..=12).contains(&month) {
        (month, if day <= 31 { day } else { 0 })
    } else {
        (0, 0)
    };
    Some(format!("{year}-{month:02}-{day:02}"))
}
