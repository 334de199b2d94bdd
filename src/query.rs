//! Structured queries over indexed documents.

use std::ops::Bound;

use tantivy::{
    Index,
    Term,
    query::{
        AllQuery,
        BooleanQuery,
        EmptyQuery,
        Occur,
        PhraseQuery,
        Query,
        QueryParser,
        RangeQuery,
        TermQuery,
    },
    schema::{Field, IndexRecordOption},
    tokenizer::TokenStream,
};

use crate::{
    entity::FieldKind,
    error::{Error, Result},
    index_store::{SchemaFields, TypedValue, fields},
};

/// A boolean combination of field clauses.
///
/// `Term` on `id`, `class` or a numeric or date field matches the exact
/// value; on any other field the value is tokenized like the indexed text,
/// so multi-word values become a phrase. `Range` only applies to numeric
/// and date fields; its bounds are inclusive and `None` leaves a side open.
/// `Text` is parsed with the index engine's query language
/// (`name:garden AND NOT deleted:true`, `rank:[0.4 TO 1.0]`, phrases)
/// against the catch-all text field by default.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Term { field: String, value: String },
    Range {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
    },
    Text(String),
    All(Vec<IndexQuery>),
    Any(Vec<IndexQuery>),
}

impl IndexQuery {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Values between `lower` and `upper`, both included.
    pub fn range(
        field: impl Into<String>,
        lower: impl Into<String>,
        upper: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }

    pub fn at_least(field: impl Into<String>, lower: impl Into<String>) -> Self {
        Self::Range {
            field: field.into(),
            lower: Some(lower.into()),
            upper: None,
        }
    }

    pub fn at_most(field: impl Into<String>, upper: impl Into<String>) -> Self {
        Self::Range {
            field: field.into(),
            lower: None,
            upper: Some(upper.into()),
        }
    }

    pub fn text(query: impl Into<String>) -> Self {
        Self::Text(query.into())
    }

    /// Matches the document of one entity.
    pub fn identity(id: impl ToString, class: &str) -> Self {
        Self::All(vec![
            Self::term(fields::ID, id.to_string()),
            Self::term(fields::CLASS, class.to_lowercase()),
        ])
    }

    /// Matches every document of one entity kind.
    pub fn class(class: &str) -> Self {
        Self::term(fields::CLASS, class.to_lowercase())
    }

    /// Conjunction, flattening nested conjunctions.
    pub fn and(self, other: IndexQuery) -> Self {
        let mut clauses = match self {
            Self::All(clauses) => clauses,
            single => vec![single],
        };
        match other {
            Self::All(more) => clauses.extend(more),
            single => clauses.push(single),
        }
        Self::All(clauses)
    }

    pub(crate) fn compile(
        &self,
        index: &Index,
        schema: &SchemaFields,
    ) -> Result<Box<dyn Query>> {
        match self {
            Self::Term { field, value } => {
                let (handle, kind) = lookup(schema, field)?;
                if let Some(typed) = typed(kind, field, value)? {
                    Ok(Box::new(TermQuery::new(
                        typed.term(handle),
                        IndexRecordOption::Basic,
                    )))
                } else if handle == schema.id || handle == schema.class {
                    Ok(Box::new(TermQuery::new(
                        Term::from_field_text(handle, value),
                        IndexRecordOption::Basic,
                    )))
                } else {
                    analyzed_term(index, handle, field, value)
                }
            }
            Self::Range {
                field,
                lower,
                upper,
            } => {
                let (handle, kind) = lookup(schema, field)?;
                if kind == FieldKind::Text {
                    return Err(Error::Query(format!(
                        "`{field}` is a text field and has no ranges"
                    )));
                }
                let bound = |value: &Option<String>| -> Result<Bound<Term>> {
                    Ok(match value {
                        Some(value) => match typed(kind, field, value)? {
                            Some(typed) => Bound::Included(typed.term(handle)),
                            None => Bound::Unbounded,
                        },
                        None => Bound::Unbounded,
                    })
                };
                Ok(Box::new(RangeQuery::new(bound(lower)?, bound(upper)?)))
            }
            Self::Text(query) => {
                let parser = QueryParser::for_index(index, vec![schema.text]);
                parser
                    .parse_query(query)
                    .map_err(|e| Error::Query(format!("`{query}`: {e}")))
            }
            Self::All(clauses) if clauses.is_empty() => Ok(Box::new(AllQuery)),
            Self::Any(clauses) if clauses.is_empty() => Ok(Box::new(EmptyQuery)),
            Self::All(clauses) => combine(index, schema, clauses, Occur::Must),
            Self::Any(clauses) => combine(index, schema, clauses, Occur::Should),
        }
    }
}

fn lookup(schema: &SchemaFields, field: &str) -> Result<(Field, FieldKind)> {
    schema
        .lookup(field)
        .ok_or_else(|| Error::Query(format!("unknown field `{field}`")))
}

fn typed(kind: FieldKind, field: &str, value: &str) -> Result<Option<TypedValue>> {
    TypedValue::parse(kind, value)
        .map_err(|reason| Error::Query(format!("field `{field}`: {reason}")))
}

fn combine(
    index: &Index,
    schema: &SchemaFields,
    clauses: &[IndexQuery],
    occur: Occur,
) -> Result<Box<dyn Query>> {
    let compiled = clauses
        .iter()
        .map(|clause| Ok((occur, clause.compile(index, schema)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Box::new(BooleanQuery::new(compiled)))
}

fn analyzed_term(
    index: &Index,
    handle: Field,
    name: &str,
    value: &str,
) -> Result<Box<dyn Query>> {
    let mut analyzer = index
        .tokenizer_for_field(handle)
        .map_err(|e| Error::Query(format!("field `{name}`: {e}")))?;
    let mut stream = analyzer.token_stream(value);
    let mut terms = Vec::new();
    while let Some(token) = stream.next() {
        terms.push(Term::from_field_text(handle, &token.text));
    }

    match terms.len() {
        0 => Err(Error::Query(format!(
            "`{value}` has no searchable terms for field `{name}`"
        ))),
        1 => Ok(Box::new(TermQuery::new(
            terms.remove(0),
            IndexRecordOption::WithFreqs,
        ))),
        _ => Ok(Box::new(PhraseQuery::new(terms))),
    }
}
