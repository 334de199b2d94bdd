//! Projection of entities into flat index documents.
//!
//! Every entity type registers a [`MappingRule`] listing the properties that
//! end up in its document. Mapping never inspects types at runtime beyond
//! looking the rule up by `TypeId`.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, BTreeSet, HashMap},
    marker::PhantomData,
};

use serde::{Deserialize, Serialize};

use crate::{
    entity::{FieldKind, FieldValue, Indexable, PropertyValue},
    error::{Error, Result},
};

/// Field names every document carries.
pub mod fields {
    pub const ID: &str = "id";
    pub const CLASS: &str = "class";
    pub const RANK: &str = "rank";
}

/// A flat field-value record stored in the index.
///
/// A missing field and a null property are the same thing: mapping never
/// stores empty placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, String>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a document for the given identity. The class is lowercased.
    pub fn for_entity(id: impl ToString, class: &str) -> Self {
        let mut doc = Self::new();
        doc.insert(fields::ID, id.to_string());
        doc.insert(fields::CLASS, class.to_lowercase());
        doc
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn id(&self) -> Option<&str> {
        self.get(fields::ID)
    }

    pub fn class(&self) -> Option<&str> {
        self.get(fields::CLASS)
    }

    /// Numeric value of the `rank` field, if present and parseable.
    pub fn rank(&self) -> Option<f64> {
        self.get(fields::RANK)?.trim().parse().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

type Getter = Box<
    dyn Fn(&dyn Any) -> std::result::Result<Option<PropertyValue>, String>
        + Send
        + Sync,
>;

struct Property {
    name: &'static str,
    kind: FieldKind,
    getter: Getter,
}

/// Declared list of properties extracted from entities of type `T`.
pub struct MappingRule<T> {
    fields: Vec<Property>,
    _entity: PhantomData<fn(&T)>,
}

impl<T: Indexable> MappingRule<T> {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Declare an infallible property. `None` omits the field. The value
    /// type decides the field kind: numbers and timestamps are typed fields.
    pub fn field<F, V>(self, name: &'static str, getter: F) -> Self
    where
        F: Fn(&T) -> Option<V> + Send + Sync + 'static,
        V: FieldValue,
    {
        self.push(name, V::KIND, move |entity| {
            Ok(getter(entity).map(Into::into))
        })
    }

    /// Declare a property whose getter may fail. Indexed as text.
    pub fn try_field<F>(self, name: &'static str, getter: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<Option<PropertyValue>, String>
            + Send
            + Sync
            + 'static,
    {
        self.push(name, FieldKind::Text, getter)
    }

    fn push<F>(mut self, name: &'static str, kind: FieldKind, getter: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<Option<PropertyValue>, String>
            + Send
            + Sync
            + 'static,
    {
        let erased: Getter = Box::new(move |any: &dyn Any| {
            let entity = any.downcast_ref::<T>().ok_or_else(|| {
                format!("getter expects {}", std::any::type_name::<T>())
            })?;
            getter(entity)
        });
        self.fields.push(Property {
            name,
            kind,
            getter: erased,
        });
        self
    }
}

impl<T: Indexable> Default for MappingRule<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct ErasedRule {
    type_name: &'static str,
    fields: Vec<Property>,
}

/// Registry of mapping rules keyed by concrete entity type.
#[derive(Default)]
pub struct DocumentMapper {
    rules: HashMap<TypeId, ErasedRule>,
}

impl DocumentMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rule for `T`. Properties named like the
    /// identity fields are ignored, identity is always injected by `map`.
    pub fn register<T: Indexable>(&mut self, rule: MappingRule<T>) {
        let fields = rule
            .fields
            .into_iter()
            .filter(|p| p.name != fields::ID && p.name != fields::CLASS)
            .collect();
        self.rules.insert(
            TypeId::of::<T>(),
            ErasedRule {
                type_name: std::any::type_name::<T>(),
                fields,
            },
        );
    }

    pub fn is_registered(&self, entity: &dyn Indexable) -> bool {
        self.rules.contains_key(&Any::type_id(entity.as_any()))
    }

    /// Every property name declared by any registered rule, sorted.
    pub fn field_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .rules
            .values()
            .flat_map(|rule| rule.fields.iter().map(|p| p.name))
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Every declared property with the kind it is indexed as. A name two
    /// rules declare with different kinds falls back to text.
    pub fn field_kinds(&self) -> BTreeMap<String, FieldKind> {
        let mut kinds: BTreeMap<String, FieldKind> = BTreeMap::new();
        for property in self.rules.values().flat_map(|rule| &rule.fields) {
            kinds
                .entry(property.name.to_string())
                .and_modify(|kind| {
                    if *kind != property.kind {
                        *kind = FieldKind::Text;
                    }
                })
                .or_insert(property.kind);
        }
        kinds
    }

    /// Build the document for `entity`.
    pub fn map(&self, entity: &dyn Indexable) -> Result<Document> {
        let class = entity.class_name().to_lowercase();
        let id = entity.entity_id().ok_or_else(|| Error::Mapping {
            class: class.clone(),
            reason: "entity has no identifier".into(),
        })?;

        let any = entity.as_any();
        let rule = self.rules.get(&Any::type_id(any)).ok_or_else(|| {
            Error::Mapping {
                class: class.clone(),
                reason: "no mapping rule registered".into(),
            }
        })?;

        let mut doc = Document::for_entity(id, &class);
        for Property { name, getter, .. } in &rule.fields {
            let value = getter(any).map_err(|reason| Error::Mapping {
                class: class.clone(),
                reason: format!(
                    "property `{name}` of {}: {reason}",
                    rule.type_name
                ),
            })?;
            if let Some(value) = value {
                doc.insert(*name, value.encode());
            }
        }

        Ok(doc)
    }
}

impl std::fmt::Debug for DocumentMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentMapper")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[derive(Debug)]
    struct Note {
        id: Option<EntityId>,
        title: String,
        body: Option<String>,
        pinned: bool,
        weight: f64,
    }

    impl Indexable for Note {
        fn entity_id(&self) -> Option<EntityId> {
            self.id
        }

        fn class_name(&self) -> &'static str {
            "Note"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Unregistered;

    impl Indexable for Unregistered {
        fn entity_id(&self) -> Option<EntityId> {
            Some(EntityId(1))
        }

        fn class_name(&self) -> &'static str {
            "unregistered"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn note_mapper() -> DocumentMapper {
        let mut mapper = DocumentMapper::new();
        mapper.register(
            MappingRule::<Note>::new()
                .field("title", |n| Some(n.title.clone()))
                .field("body", |n| n.body.clone())
                .field("pinned", |n| Some(n.pinned))
                .field("weight", |n| Some(n.weight)),
        );
        mapper
    }

    fn note(id: Option<u64>) -> Note {
        Note {
            id: id.map(EntityId),
            title: "Groceries".into(),
            body: None,
            pinned: true,
            weight: 1.5,
        }
    }

    #[test]
    fn maps_identity_and_properties() {
        let doc = note_mapper().map(&note(Some(12))).unwrap();

        assert_eq!(doc.id(), Some("12"));
        assert_eq!(doc.class(), Some("note"));
        assert_eq!(doc.get("title"), Some("Groceries"));
        assert_eq!(doc.get("pinned"), Some("true"));
        assert_eq!(doc.get("weight"), Some("1.5"));
    }

    #[test]
    fn null_property_is_omitted() {
        let doc = note_mapper().map(&note(Some(12))).unwrap();

        assert!(!doc.contains("body"));
        assert_eq!(doc.get("body"), None);
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn missing_identifier_is_rejected() {
        let err = note_mapper().map(&note(None)).unwrap_err();
        assert!(matches!(err, Error::Mapping { ref class, .. } if class == "note"));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let mapper = note_mapper();
        assert!(!mapper.is_registered(&Unregistered));
        assert!(matches!(
            mapper.map(&Unregistered),
            Err(Error::Mapping { .. })
        ));
    }

    #[test]
    fn failing_getter_is_a_mapping_error() {
        let mut mapper = DocumentMapper::new();
        mapper.register(
            MappingRule::<Note>::new()
                .try_field("title", |_| Err("lazy load failed".into())),
        );

        let err = mapper.map(&note(Some(1))).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("title"), "{msg}");
        assert!(msg.contains("lazy load failed"), "{msg}");
    }

    #[test]
    fn identity_fields_cannot_be_overridden() {
        let mut mapper = DocumentMapper::new();
        mapper.register(
            MappingRule::<Note>::new()
                .field("id", |_| Some("bogus"))
                .field("title", |n| Some(n.title.clone())),
        );

        let doc = mapper.map(&note(Some(3))).unwrap();
        assert_eq!(doc.id(), Some("3"));
        assert_eq!(mapper.field_names(), vec!["title".to_string()]);
    }

    #[test]
    fn field_names_are_sorted_and_unique() {
        let mapper = note_mapper();
        assert_eq!(
            mapper.field_names(),
            vec!["body", "pinned", "title", "weight"]
        );
    }

    #[test]
    fn field_kinds_follow_getter_types() {
        let kinds = note_mapper().field_kinds();
        assert_eq!(kinds["title"], FieldKind::Text);
        assert_eq!(kinds["pinned"], FieldKind::Text);
        assert_eq!(kinds["weight"], FieldKind::Float);
    }

    #[test]
    fn conflicting_kinds_fall_back_to_text() {
        let mut mapper = note_mapper();
        mapper.register(
            MappingRule::<Unregistered>::new().field("weight", |_| Some("heavy")),
        );
        assert_eq!(mapper.field_kinds()["weight"], FieldKind::Text);
    }

    #[test]
    fn rank_parses_numeric_field() {
        let doc = Document::for_entity(1, "Project").with(fields::RANK, "0.75");
        assert_eq!(doc.class(), Some("project"));
        assert_eq!(doc.rank(), Some(0.75));

        let unparsable = Document::new().with(fields::RANK, "high");
        assert_eq!(unparsable.rank(), None);
    }
}
