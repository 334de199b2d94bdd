//! The GTD entity kinds and their index mapping rules.

use std::{any::Any, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    entity::{EntityId, Indexable, Persistent, PropertyValue, Style, Trashable},
    mapper::{DocumentMapper, MappingRule},
};

/// Class names of every entity kind, as stored in the `class` field.
pub const CLASSES: [&str; 6] = [
    "project",
    "actionitem",
    "inboxcontext",
    "category",
    "tag",
    "referenceitem",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Someday,
    Completed,
}

impl Style for ProjectStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Someday => "someday",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    #[default]
    Next,
    Waiting,
    Scheduled,
    Done,
}

impl Style for ActionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Waiting => "waiting",
            Self::Scheduled => "scheduled",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Style for Priority {
    fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub deleted: bool,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            status: ProjectStatus::default(),
            created: Utc::now(),
            due: None,
            rank: None,
            deleted: false,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(EntityId(id));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub state: ActionState,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub project: Option<EntityId>,
    #[serde(default)]
    pub context: Option<EntityId>,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub deleted: bool,
}

impl ActionItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            notes: None,
            state: ActionState::default(),
            priority: Priority::default(),
            project: None,
            context: None,
            due: None,
            created: Utc::now(),
            rank: None,
            deleted: false,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(EntityId(id));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxContext {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

macro_rules! entity_kind {
    ($ty:ident, $class:literal) => {
        impl Indexable for $ty {
            fn entity_id(&self) -> Option<EntityId> {
                self.id
            }

            fn class_name(&self) -> &'static str {
                $class
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        impl Persistent for $ty {
            fn into_indexable(self: Arc<Self>) -> Option<Arc<dyn Indexable>> {
                Some(self)
            }
        }
    };
}

entity_kind!(Project, "project");
entity_kind!(ActionItem, "actionitem");
entity_kind!(InboxContext, "inboxcontext");
entity_kind!(Category, "category");
entity_kind!(Tag, "tag");
entity_kind!(ReferenceItem, "referenceitem");

macro_rules! plain_trashable {
    ($($ty:ident),*) => {
        $(
            impl Trashable for $ty {
                fn is_deleted(&self) -> bool {
                    self.deleted
                }

                fn set_deleted(&mut self, deleted: bool) {
                    self.deleted = deleted;
                }
            }
        )*
    };
}

plain_trashable!(Project, InboxContext, Category, Tag, ReferenceItem);

impl Trashable for ActionItem {
    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    fn prepare_for_deletion(&mut self) {
        self.project = None;
        self.context = None;
    }
}

/// Any stored entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Project(Project),
    ActionItem(ActionItem),
    InboxContext(InboxContext),
    Category(Category),
    Tag(Tag),
    ReferenceItem(ReferenceItem),
}

macro_rules! each_kind {
    ($entity:expr, $inner:ident => $body:expr) => {
        match $entity {
            Entity::Project($inner) => $body,
            Entity::ActionItem($inner) => $body,
            Entity::InboxContext($inner) => $body,
            Entity::Category($inner) => $body,
            Entity::Tag($inner) => $body,
            Entity::ReferenceItem($inner) => $body,
        }
    };
}

impl Entity {
    pub fn id(&self) -> Option<EntityId> {
        each_kind!(self, e => e.id)
    }

    pub fn set_id(&mut self, id: EntityId) {
        each_kind!(self, e => e.id = Some(id))
    }

    pub fn class_name(&self) -> &'static str {
        self.as_indexable().class_name()
    }

    pub fn as_indexable(&self) -> &dyn Indexable {
        each_kind!(self, e => e as &dyn Indexable)
    }

    pub fn as_trashable_mut(&mut self) -> &mut dyn Trashable {
        each_kind!(self, e => e as &mut dyn Trashable)
    }

    pub fn into_indexable(self) -> Arc<dyn Indexable> {
        each_kind!(self, e => Arc::new(e) as Arc<dyn Indexable>)
    }

    pub fn into_persistent(self) -> Arc<dyn Persistent> {
        each_kind!(self, e => Arc::new(e) as Arc<dyn Persistent>)
    }

    /// Move the entity to the trash: detach it, then flag it deleted.
    pub fn trash(&mut self) {
        let trashable = self.as_trashable_mut();
        trashable.prepare_for_deletion();
        trashable.set_deleted(true);
    }
}

macro_rules! entity_from {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Entity {
                fn from(value: $ty) -> Self {
                    Entity::$ty(value)
                }
            }
        )*
    };
}

entity_from!(Project, ActionItem, InboxContext, Category, Tag, ReferenceItem);

/// Register the mapping rules of every entity kind.
pub fn register_model(mapper: &mut DocumentMapper) {
    mapper.register(
        MappingRule::<Project>::new()
            .field("name", |p| Some(p.name.clone()))
            .field("description", |p| p.description.clone())
            .field("status", |p| Some(PropertyValue::style(p.status)))
            .field("created", |p| Some(p.created))
            .field("due", |p| p.due)
            .field("rank", |p| p.rank)
            .field("deleted", |p| Some(p.deleted)),
    );
    mapper.register(
        MappingRule::<ActionItem>::new()
            .field("description", |a| Some(a.description.clone()))
            .field("notes", |a| a.notes.clone())
            .field("state", |a| Some(PropertyValue::style(a.state)))
            .field("priority", |a| Some(PropertyValue::style(a.priority)))
            .field("project", |a| a.project)
            .field("context", |a| a.context)
            .field("due", |a| a.due)
            .field("created", |a| Some(a.created))
            .field("rank", |a| a.rank)
            .field("deleted", |a| Some(a.deleted)),
    );
    mapper.register(
        MappingRule::<InboxContext>::new()
            .field("name", |c| Some(c.name.clone()))
            .field("description", |c| c.description.clone())
            .field("deleted", |c| Some(c.deleted)),
    );
    mapper.register(
        MappingRule::<Category>::new()
            .field("name", |c| Some(c.name.clone()))
            .field("deleted", |c| Some(c.deleted)),
    );
    mapper.register(
        MappingRule::<Tag>::new()
            .field("name", |t| Some(t.name.clone()))
            .field("deleted", |t| Some(t.deleted)),
    );
    mapper.register(
        MappingRule::<ReferenceItem>::new()
            .field("title", |r| Some(r.title.clone()))
            .field("content", |r| r.content.clone())
            .field("url", |r| r.url.clone())
            .field("created", |r| Some(r.created))
            .field("deleted", |r| Some(r.deleted)),
    );
}

impl DocumentMapper {
    /// A mapper with every entity kind registered.
    pub fn with_model() -> Self {
        let mut mapper = Self::new();
        register_model(&mut mapper);
        mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_registered() {
        let mapper = DocumentMapper::with_model();
        let entities: Vec<Entity> = vec![
            Project::new("p").with_id(1).into(),
            ActionItem::new("a").with_id(2).into(),
            InboxContext {
                id: Some(EntityId(3)),
                name: "@home".into(),
                description: None,
                deleted: false,
            }
            .into(),
            Category {
                id: Some(EntityId(4)),
                name: "work".into(),
                deleted: false,
            }
            .into(),
            Tag {
                id: Some(EntityId(5)),
                name: "urgent".into(),
                deleted: false,
            }
            .into(),
            ReferenceItem {
                id: Some(EntityId(6)),
                title: "manual".into(),
                content: None,
                url: None,
                created: Utc::now(),
                deleted: false,
            }
            .into(),
        ];

        for entity in &entities {
            let doc = mapper.map(entity.as_indexable()).unwrap();
            assert_eq!(doc.class(), Some(entity.class_name()));
            assert!(CLASSES.contains(&entity.class_name()));
        }
    }

    #[test]
    fn project_document_fields() {
        let mut project = Project::new("Oogedy Booegedy Boo").with_id(284262);
        project.status = ProjectStatus::Someday;
        project.rank = Some(0.5);

        let doc = DocumentMapper::with_model().map(&project).unwrap();
        assert_eq!(doc.id(), Some("284262"));
        assert_eq!(doc.class(), Some("project"));
        assert_eq!(doc.get("name"), Some("Oogedy Booegedy Boo"));
        assert_eq!(doc.get("status"), Some("someday"));
        assert_eq!(doc.get("rank"), Some("0.5"));
        assert_eq!(doc.get("deleted"), Some("false"));
        assert!(!doc.contains("description"));
        assert!(!doc.contains("due"));
    }

    #[test]
    fn trashing_an_action_detaches_it() {
        let mut action = ActionItem::new("call bob").with_id(9);
        action.project = Some(EntityId(1));
        action.context = Some(EntityId(2));
        let mut entity = Entity::from(action);

        entity.trash();

        let Entity::ActionItem(action) = &entity else {
            panic!("kind changed");
        };
        assert!(action.deleted);
        assert_eq!(action.project, None);
        assert_eq!(action.context, None);
    }

    #[test]
    fn entity_json_is_tagged_by_kind() {
        let json = r#"{"kind":"project","id":7,"name":"Garden"}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();

        assert_eq!(entity.id(), Some(EntityId(7)));
        assert_eq!(entity.class_name(), "project");
        let Entity::Project(project) = entity else {
            panic!("expected a project");
        };
        assert_eq!(project.status, ProjectStatus::Active);
        assert!(!project.deleted);
    }

    #[test]
    fn persistent_view_exposes_indexable() {
        let entity = Entity::from(Tag {
            id: Some(EntityId(5)),
            name: "urgent".into(),
            deleted: false,
        });
        let indexable = entity.into_persistent().into_indexable().unwrap();
        assert_eq!(indexable.class_name(), "tag");
        assert_eq!(indexable.entity_id(), Some(EntityId(5)));
    }
}
