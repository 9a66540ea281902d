//! Fixed-capacity ordered slot sequences.
//!
//! Sections, FAQs, PAAs, tables, takeaways and sources are bounded. A
//! [`Slots<T, N>`] holds at most `N` active items in order; slot indexes past
//! the active count are inactive. Pushing past capacity is a contract
//! violation, and deserializing more than `N` items fails, so the bounds hold
//! structurally for every record that reaches a stage.

use std::fmt;
use std::marker::PhantomData;

use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ArticleForgeError, Result};

/// State of one slot position.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotState<'a, T> {
    Active(&'a T),
    Inactive,
}

/// An ordered sequence with at most `N` active items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slots<T, const N: usize> {
    items: Vec<T>,
}

impl<T, const N: usize> Default for Slots<T, N> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T, const N: usize> Slots<T, N> {
    /// Maximum number of active items.
    pub const CAPACITY: usize = N;

    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a vector, rejecting anything over capacity.
    pub fn from_vec(items: Vec<T>) -> Result<Self> {
        if items.len() > N {
            return Err(ArticleForgeError::contract(
                "schema",
                format!("{} items exceed slot capacity {N}", items.len()),
            ));
        }
        Ok(Self { items })
    }

    /// Append into the next inactive slot.
    pub fn try_push(&mut self, item: T) -> Result<()> {
        if self.items.len() >= N {
            return Err(ArticleForgeError::contract(
                "schema",
                format!("slot capacity {N} already filled"),
            ));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == N
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    /// State of slot `index`; positions past capacity are reported inactive too.
    pub fn slot(&self, index: usize) -> SlotState<'_, T> {
        match self.items.get(index) {
            Some(item) => SlotState::Active(item),
            None => SlotState::Inactive,
        }
    }

    /// Number of inactive slots left.
    pub fn inactive(&self) -> usize {
        N - self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Remove the item at `index`, shifting later items down one slot.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a Slots<T, N> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize, const N: usize> Serialize for Slots<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

struct SlotsVisitor<T, const N: usize>(PhantomData<T>);

impl<'de, T: Deserialize<'de>, const N: usize> Visitor<'de> for SlotsVisitor<T, N> {
    type Value = Slots<T, N>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sequence of at most {N} items")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(N.min(seq.size_hint().unwrap_or(0)));
        while let Some(item) = seq.next_element()? {
            if items.len() == N {
                return Err(de::Error::invalid_length(N + 1, &self));
            }
            items.push(item);
        }
        Ok(Slots { items })
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(Slots::default())
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for Slots<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(SlotsVisitor::<T, N>(PhantomData))
    }
}

impl<T: JsonSchema, const N: usize> JsonSchema for Slots<T, N> {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        format!("Slots_{}_{N}", T::schema_name())
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = <Vec<T>>::json_schema(generator).into_object();
        schema.array().max_items = Some(N as u32);
        Schema::Object(schema)
    }
}
