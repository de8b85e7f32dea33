//! Element tree and page list model
//!
//! The element tree is a rooted, ordered forest with children stored inline.
//! Every function here is pure: it reads a slice and returns a new vector,
//! leaving the input untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A visual-editor element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<Element>>,
    /// Fields this engine does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Element {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            order: 0,
            kind: kind.into(),
            content: None,
            name: None,
            styles: None,
            settings: None,
            elements: None,
            extra: Map::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn with_children(mut self, children: Vec<Element>) -> Self {
        self.elements = Some(children);
        self
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Direct children, empty if the element has none
    pub fn children(&self) -> &[Element] {
        self.elements.as_deref().unwrap_or(&[])
    }
}

/// A page entry, keyed by `Id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Page {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Find an element anywhere in the tree
pub fn find_element<'a>(elements: &'a [Element], id: &str) -> Option<&'a Element> {
    for element in elements {
        if element.id == id {
            return Some(element);
        }
        if let Some(found) = find_element(element.children(), id) {
            return Some(found);
        }
    }
    None
}

pub fn contains_element(elements: &[Element], id: &str) -> bool {
    find_element(elements, id).is_some()
}

/// All element ids, depth-first in sibling order
pub fn collect_ids(elements: &[Element]) -> Vec<String> {
    let mut ids = Vec::new();
    collect_into(elements, &mut ids);
    ids
}

fn collect_into(elements: &[Element], ids: &mut Vec<String>) {
    for element in elements {
        ids.push(element.id.clone());
        collect_into(element.children(), ids);
    }
}

/// Insert-or-replace keyed by id.
///
/// An existing node is replaced where it stands. A new node goes into its
/// declared parent at `order` (clamped to the sibling count), or into the
/// root sequence when it has no parent or the parent is not in the tree.
pub fn upsert_element(elements: &[Element], element: Element) -> Vec<Element> {
    if contains_element(elements, &element.id) {
        replace_element(elements, element)
    } else {
        insert_element(elements, element)
    }
}

fn replace_element(elements: &[Element], element: Element) -> Vec<Element> {
    elements
        .iter()
        .map(|existing| {
            if existing.id == element.id {
                element.clone()
            } else if contains_element(existing.children(), &element.id) {
                let mut copy = existing.clone();
                copy.elements = Some(replace_element(existing.children(), element.clone()));
                copy
            } else {
                existing.clone()
            }
        })
        .collect()
}

fn insert_element(elements: &[Element], mut element: Element) -> Vec<Element> {
    match element.parent_id.clone() {
        Some(parent_id) if contains_element(elements, &parent_id) => {
            insert_under(elements, &parent_id, element)
        }
        _ => {
            element.parent_id = None;
            splice_at(elements, element)
        }
    }
}

fn insert_under(elements: &[Element], parent_id: &str, element: Element) -> Vec<Element> {
    elements
        .iter()
        .map(|existing| {
            if existing.id == parent_id {
                let mut copy = existing.clone();
                copy.elements = Some(splice_at(existing.children(), element.clone()));
                copy
            } else if contains_element(existing.children(), parent_id) {
                let mut copy = existing.clone();
                copy.elements = Some(insert_under(existing.children(), parent_id, element.clone()));
                copy
            } else {
                existing.clone()
            }
        })
        .collect()
}

fn splice_at(siblings: &[Element], element: Element) -> Vec<Element> {
    let index = element.order.clamp(0, siblings.len() as i64) as usize;
    let mut result = Vec::with_capacity(siblings.len() + 1);
    result.extend_from_slice(&siblings[..index]);
    result.push(element);
    result.extend_from_slice(&siblings[index..]);
    result
}

/// Remove a node wherever it is nested, returning the new tree and the
/// removed subtree (if the id was present).
pub fn remove_element(elements: &[Element], id: &str) -> (Vec<Element>, Option<Element>) {
    let mut removed = None;
    let tree = remove_inner(elements, id, &mut removed);
    (tree, removed)
}

fn remove_inner(elements: &[Element], id: &str, removed: &mut Option<Element>) -> Vec<Element> {
    let mut result = Vec::with_capacity(elements.len());
    for element in elements {
        if element.id == id {
            *removed = Some(element.clone());
            continue;
        }
        if removed.is_none() && contains_element(element.children(), id) {
            let mut copy = element.clone();
            copy.elements = Some(remove_inner(element.children(), id, removed));
            result.push(copy);
        } else {
            result.push(element.clone());
        }
    }
    result
}

/// Remove a node and every id in `cascade`
pub fn delete_elements(elements: &[Element], id: &str, cascade: &[String]) -> Vec<Element> {
    let (mut tree, _) = remove_element(elements, id);
    for child_id in cascade {
        if contains_element(&tree, child_id) {
            tree = remove_element(&tree, child_id).0;
        }
    }
    tree
}

/// Remove a node then re-insert it under `new_parent_id` at `new_order`.
///
/// If the target parent is not in the tree once the node has been removed
/// (absent, or inside the moved subtree) the node lands at root level.
/// Moving an unknown id leaves the tree unchanged.
pub fn move_element(
    elements: &[Element],
    id: &str,
    new_parent_id: Option<&str>,
    new_order: i64,
) -> Vec<Element> {
    let (tree, removed) = remove_element(elements, id);
    let Some(mut node) = removed else {
        return elements.to_vec();
    };

    node.order = new_order;
    node.parent_id = new_parent_id
        .filter(|parent| contains_element(&tree, parent))
        .map(str::to_string);

    insert_element(&tree, node)
}

/// Insert-or-replace a page by `Id`; new pages are appended
pub fn upsert_page(pages: &[Page], page: Page) -> Vec<Page> {
    if pages.iter().any(|p| p.id == page.id) {
        pages
            .iter()
            .map(|p| if p.id == page.id { page.clone() } else { p.clone() })
            .collect()
    } else {
        let mut result = pages.to_vec();
        result.push(page);
        result
    }
}

pub fn remove_page(pages: &[Page], id: &str) -> Vec<Page> {
    pages.iter().filter(|p| p.id != id).cloned().collect()
}
