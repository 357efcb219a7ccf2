//! In-memory HTML document with child-list change notification.
//!
//! Parsing, selector matching and serialization go through `scraper`; this
//! module adds stable element handles, subtree insertion and observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ego_tree::{NodeId, NodeMut, NodeRef, Tree};
use html5ever::tendril::StrTendril;
use html5ever::{Attribute, LocalName, Namespace, QualName};
use scraper::node::Element;
use scraper::{ElementRef, Html, Node};
use tokio::sync::mpsc;

use super::{Document, MutationRecord, MutationSubscription, Selector};
use crate::lock;
use crate::types::{ElementHandle, EmbedError, EmbedResult};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// Detached nodes tolerated before the tree is rebuilt.
const COMPACT_THRESHOLD: usize = 1024;

/// Two-way table between handles given out and nodes of the current tree.
#[derive(Debug, Default)]
struct Handles {
    by_node: HashMap<NodeId, ElementHandle>,
    by_handle: HashMap<ElementHandle, NodeId>,
    next: u64,
}

impl Handles {
    fn handle(&mut self, node: NodeId) -> ElementHandle {
        if let Some(&handle) = self.by_node.get(&node) {
            return handle;
        }
        self.next += 1;
        let handle = ElementHandle(self.next);
        self.by_node.insert(node, handle);
        self.by_handle.insert(handle, node);
        handle
    }

    fn node(&self, handle: ElementHandle) -> Option<NodeId> {
        self.by_handle.get(&handle).copied()
    }

    /// Re-point handles after a rebuild. Handles of nodes that did not
    /// survive are dropped.
    fn remap(&mut self, moved: &HashMap<NodeId, NodeId>) {
        let by_handle: HashMap<ElementHandle, NodeId> = self
            .by_handle
            .iter()
            .filter_map(|(&handle, old)| moved.get(old).map(|&new| (handle, new)))
            .collect();
        self.by_node = by_handle.iter().map(|(&h, &n)| (n, h)).collect();
        self.by_handle = by_handle;
    }
}

#[derive(Debug)]
struct State {
    html: Html,
    head: NodeId,
    body: NodeId,
    handles: Handles,
    /// Nodes detached from the document but still held by the arena.
    garbage: usize,
}

impl State {
    fn new(html: Html) -> Self {
        let root = html.root_element();
        let child = |name: &str| {
            root.child_elements()
                .find(|e| e.value().name() == name)
                .map(|e| e.id())
                .unwrap_or_else(|| root.id())
        };
        let (head, body) = (child("head"), child("body"));
        Self {
            html,
            head,
            body,
            handles: Handles::default(),
            garbage: 0,
        }
    }

    fn element(&self, handle: ElementHandle) -> Option<ElementRef<'_>> {
        let node = self.handles.node(handle)?;
        self.html.tree.get(node).and_then(ElementRef::wrap)
    }

    fn live_nodes(&self) -> usize {
        self.html.tree.root().descendants().count()
    }

    /// Detach every child of `node`, returning their serialized markup.
    fn detach_children(&mut self, node: NodeId) -> String {
        let Some(parent) = self.html.tree.get(node) else {
            return String::new();
        };
        let markup = ElementRef::wrap(parent)
            .map(|e| e.inner_html())
            .unwrap_or_default();
        let children: Vec<(NodeId, usize)> = parent
            .children()
            .map(|c| (c.id(), c.descendants().count()))
            .collect();
        for (child, size) in children {
            if let Some(mut child) = self.html.tree.get_mut(child) {
                child.detach();
                self.garbage += size;
            }
        }
        markup
    }

    /// Parse `markup` as a fragment and append its nodes under `node`.
    /// Returns handles of the inserted top-level elements and whether any
    /// node at all was inserted.
    fn append_markup(&mut self, node: NodeId, markup: &str) -> (Vec<ElementHandle>, bool) {
        let fragment = Html::parse_fragment(markup);
        let source = fragment.root_element();
        let Some(mut parent) = self.html.tree.get_mut(node) else {
            return (Vec::new(), false);
        };

        let mut inserted = Vec::new();
        for child in source.children() {
            let mut copy = parent.append(child.value().clone());
            inserted.push((copy.id(), child.value().is_element()));
            graft(child, &mut copy, &mut HashMap::new());
        }

        let any = !inserted.is_empty();
        let added = inserted
            .into_iter()
            .filter(|&(_, is_element)| is_element)
            .map(|(id, _)| self.handles.handle(id))
            .collect();
        (added, any)
    }

    /// Run `edit` over the attributes of `handle`. When it reports a change
    /// the element is rebuilt, which also resets scraper's cached classes.
    fn edit_attributes(
        &mut self,
        handle: ElementHandle,
        edit: impl FnOnce(&mut Vec<(QualName, String)>) -> bool,
    ) -> bool {
        let Some(node) = self.handles.node(handle) else {
            return false;
        };
        let Some(mut node) = self.html.tree.get_mut(node) else {
            return false;
        };
        let Node::Element(element) = node.value() else {
            return false;
        };
        let mut attributes: Vec<(QualName, String)> = element
            .attrs
            .iter()
            .map(|(name, value)| (name.clone(), (**value).to_string()))
            .collect();
        if !edit(&mut attributes) {
            return false;
        }
        let attributes = attributes
            .into_iter()
            .map(|(name, value)| Attribute {
                name,
                value: StrTendril::from(value),
            })
            .collect();
        *element = Element::new(element.name.clone(), attributes);
        true
    }

    /// Rebuild the arena from the live tree once detached nodes dominate it.
    fn maybe_compact(&mut self) {
        if self.garbage < COMPACT_THRESHOLD || self.garbage < self.live_nodes() {
            return;
        }
        let old = &self.html.tree;
        let mut tree = Tree::new(old.root().value().clone());
        let mut moved = HashMap::new();
        moved.insert(old.root().id(), tree.root().id());
        graft(old.root(), &mut tree.root_mut(), &mut moved);

        let head = moved.get(&self.head).copied();
        let body = moved.get(&self.body).copied();
        let (Some(head), Some(body)) = (head, body) else {
            return;
        };
        tracing::debug!(
            "Compacted document: {} detached nodes released",
            self.garbage
        );
        self.html.tree = tree;
        self.head = head;
        self.body = body;
        self.handles.remap(&moved);
        self.garbage = 0;
    }
}

/// Deep-copy the children of `source` under `target`, recording old to new ids.
fn graft(
    source: NodeRef<'_, Node>,
    target: &mut NodeMut<'_, Node>,
    moved: &mut HashMap<NodeId, NodeId>,
) {
    for child in source.children() {
        let mut copy = target.append(child.value().clone());
        moved.insert(child.id(), copy.id());
        graft(child, &mut copy, moved);
    }
}

fn qual_name(namespace: &str, local: &str) -> QualName {
    QualName::new(None, Namespace::from(namespace), LocalName::from(local))
}

fn attribute(name: &str, value: &str) -> Attribute {
    Attribute {
        name: qual_name("", name),
        value: StrTendril::from(value),
    }
}

struct Observer {
    target: ElementHandle,
    sender: mpsc::UnboundedSender<Vec<MutationRecord>>,
}

type ObserverMap = Arc<Mutex<HashMap<u64, Observer>>>;

/// [`Document`] backed by a parsed `scraper::Html` tree.
pub struct MemoryDocument {
    state: Mutex<State>,
    observers: ObserverMap,
    next_observer: AtomicU64,
    change_notification: bool,
}

impl MemoryDocument {
    /// Empty document: `html`, `head` and `body` only.
    pub fn new() -> Self {
        Self::parse("")
    }

    /// Parse a full HTML document. Missing `html`/`head`/`body` elements are
    /// created by the parser.
    pub fn parse(source: &str) -> Self {
        Self {
            state: Mutex::new(State::new(Html::parse_document(source))),
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_observer: AtomicU64::new(1),
            change_notification: true,
        }
    }

    /// A document whose environment offers no change notification.
    pub fn without_change_notification() -> Self {
        let mut doc = Self::new();
        doc.change_notification = false;
        doc
    }

    pub fn head(&self) -> ElementHandle {
        let mut state = lock(&self.state);
        let head = state.head;
        state.handles.handle(head)
    }

    pub fn body(&self) -> ElementHandle {
        let mut state = lock(&self.state);
        let body = state.body;
        state.handles.handle(body)
    }

    /// Append the first element of `markup` under `parent`.
    pub fn append_element(&self, parent: ElementHandle, markup: &str) -> Option<ElementHandle> {
        self.append_html(parent, markup).into_iter().next()
    }

    /// Parse `markup` and append it under `parent` as a single notification
    /// batch. Returns handles of the inserted top-level elements.
    pub fn append_html(&self, parent: ElementHandle, markup: &str) -> Vec<ElementHandle> {
        let (added, any) = {
            let mut state = lock(&self.state);
            let Some(node) = state.element(parent).map(|e| e.id()) else {
                return Vec::new();
            };
            state.append_markup(node, markup)
        };
        if any {
            self.notify(parent, added.clone());
        }
        added
    }

    /// Remove the children of `element` without notifying observers and
    /// return them as markup.
    pub fn detach_children(&self, element: ElementHandle) -> Option<String> {
        let mut state = lock(&self.state);
        let node = state.element(element)?.id();
        let markup = state.detach_children(node);
        state.maybe_compact();
        Some(markup)
    }

    /// Serialized children of `element`.
    pub fn inner_html(&self, element: ElementHandle) -> Option<String> {
        lock(&self.state).element(element).map(|e| e.inner_html())
    }

    pub fn class_list(&self, element: ElementHandle) -> Vec<String> {
        self.attribute(element, "class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// `href`s of the stylesheet links in the head, in document order.
    pub fn stylesheets(&self) -> Vec<String> {
        let Ok(links) = Selector::parse(r#"link[rel="stylesheet"]"#) else {
            return Vec::new();
        };
        let head = self.head();
        let state = lock(&self.state);
        let Some(head) = state.element(head) else {
            return Vec::new();
        };
        let hrefs = head
            .select(links.compiled())
            .filter_map(|link| link.value().attr("href").map(str::to_string))
            .collect();
        hrefs
    }

    pub fn to_html(&self) -> String {
        lock(&self.state).html.html()
    }

    /// Number of nodes held by the arena, attached or not.
    pub fn arena_len(&self) -> usize {
        lock(&self.state).html.tree.nodes().count()
    }

    /// Number of live change subscriptions.
    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    fn notify(&self, target: ElementHandle, added: Vec<ElementHandle>) {
        let record = MutationRecord { target, added };
        lock(&self.observers).retain(|_, observer| {
            observer.target != target || observer.sender.send(vec![record.clone()]).is_ok()
        });
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocument")
            .field("change_notification", &self.change_notification)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Document for MemoryDocument {
    fn query_selector(&self, selector: &Selector) -> Option<ElementHandle> {
        self.query_selector_all(None, selector).into_iter().next()
    }

    fn query_selector_all(
        &self,
        scope: Option<ElementHandle>,
        selector: &Selector,
    ) -> Vec<ElementHandle> {
        let mut state = lock(&self.state);
        let compiled = selector.compiled();
        let found: Vec<NodeId> = match scope {
            None => {
                let root = state.html.root_element();
                std::iter::once(root)
                    .filter(|r| compiled.matches(r))
                    .chain(root.select(compiled))
                    .map(|e| e.id())
                    .collect()
            }
            Some(scope) => match state.element(scope) {
                Some(scope) => scope.select(compiled).map(|e| e.id()).collect(),
                None => Vec::new(),
            },
        };
        found
            .into_iter()
            .map(|node| state.handles.handle(node))
            .collect()
    }

    fn attribute(&self, element: ElementHandle, name: &str) -> Option<String> {
        let state = lock(&self.state);
        let element = state.element(element)?;
        element
            .value()
            .attr(&name.to_ascii_lowercase())
            .map(str::to_string)
    }

    fn has_class(&self, element: ElementHandle, class: &str) -> bool {
        self.class_list(element).iter().any(|c| c == class)
    }

    fn add_class(&self, element: ElementHandle, class: &str) {
        lock(&self.state).edit_attributes(element, |attributes| {
            match attributes.iter_mut().find(|(name, _)| name.local.as_ref() == "class") {
                Some((_, value)) if value.split_whitespace().any(|c| c == class) => false,
                Some((_, value)) => {
                    if !value.trim().is_empty() {
                        value.push(' ');
                    }
                    value.push_str(class);
                    true
                }
                None => {
                    attributes.push((qual_name("", "class"), class.to_string()));
                    true
                }
            }
        });
    }

    fn set_attribute(&self, element: ElementHandle, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        lock(&self.state).edit_attributes(element, |attributes| {
            match attributes.iter_mut().find(|(n, _)| n.local.as_ref() == name) {
                Some((_, existing)) if existing.as_str() == value => false,
                Some((_, existing)) => {
                    *existing = value.to_string();
                    true
                }
                None => {
                    attributes.push((qual_name("", &name), value.to_string()));
                    true
                }
            }
        });
    }

    fn insert_attribute(&self, element: ElementHandle, name: &str, value: &str) -> bool {
        let name = name.to_ascii_lowercase();
        lock(&self.state).edit_attributes(element, |attributes| {
            if attributes.iter().any(|(n, _)| n.local.as_ref() == name) {
                return false;
            }
            attributes.push((qual_name("", &name), value.to_string()));
            true
        })
    }

    fn remove_attribute(&self, element: ElementHandle, name: &str) {
        let name = name.to_ascii_lowercase();
        lock(&self.state).edit_attributes(element, |attributes| {
            let before = attributes.len();
            attributes.retain(|(n, _)| n.local.as_ref() != name);
            attributes.len() != before
        });
    }

    fn set_inner_html(&self, element: ElementHandle, markup: &str) {
        let (added, any) = {
            let mut state = lock(&self.state);
            let Some(node) = state.element(element).map(|e| e.id()) else {
                return;
            };
            let had_children = state.html.tree.get(node).is_some_and(|n| n.has_children());
            state.detach_children(node);
            let (added, any) = state.append_markup(node, markup);
            state.maybe_compact();
            (added, any || had_children)
        };
        if any {
            self.notify(element, added);
        }
    }

    fn append_stylesheet(&self, href: &str) {
        let head = self.head();
        let link = Element::new(
            qual_name(HTML_NAMESPACE, "link"),
            vec![
                attribute("type", "text/css"),
                attribute("rel", "stylesheet"),
                attribute("media", "all"),
                attribute("href", href),
            ],
        );
        let mut state = lock(&self.state);
        let Some(node) = state.handles.node(head) else {
            return;
        };
        let id = match state.html.tree.get_mut(node) {
            Some(mut parent) => {
                let child = parent.append(Node::Element(link));
                child.id()
            }
            None => return,
        };
        let added = vec![state.handles.handle(id)];
        drop(state);
        self.notify(head, added);
    }

    fn supports_change_notification(&self) -> bool {
        self.change_notification
    }

    fn observe_child_list(&self, target: ElementHandle) -> EmbedResult<MutationSubscription> {
        if !self.change_notification {
            return Err(EmbedError::UnsupportedCapability(
                "change notification".to_string(),
            ));
        }
        if lock(&self.state).element(target).is_none() {
            return Err(EmbedError::ContainerNotFound(target.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).insert(id, Observer { target, sender });

        let observers = Arc::clone(&self.observers);
        Ok(MutationSubscription::new(receiver, move || {
            lock(&observers).remove(&id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gist(id: &str) -> String {
        format!(r#"<code data-gist-id="{id}"></code>"#)
    }

    fn select(doc: &MemoryDocument, selector: &str) -> Vec<ElementHandle> {
        doc.query_selector_all(None, &Selector::parse(selector).unwrap())
    }

    #[test]
    fn test_new_document_shape() {
        let doc = MemoryDocument::new();
        assert_eq!(doc.to_html(), "<html><head></head><body></body></html>");
        assert_ne!(doc.head(), doc.body());
    }

    #[test]
    fn test_parse_fragment_gets_body() {
        let doc = MemoryDocument::parse(&gist("1"));
        let found = select(&doc, "body > code[data-gist-id]");
        assert_eq!(found.len(), 1);
        assert_eq!(doc.attribute(found[0], "data-gist-id").as_deref(), Some("1"));
        assert_eq!(doc.attribute(found[0], "DATA-GIST-ID").as_deref(), Some("1"));
    }

    #[test]
    fn test_handles_are_stable() {
        let doc = MemoryDocument::parse(r#"<div id="gists"></div>"#);
        let first = select(&doc, "#gists");
        let second = select(&doc, "div#gists");
        assert_eq!(first, second);
        assert_eq!(select(&doc, "html").len(), 1);
    }

    #[test]
    fn test_scoped_query() {
        let doc = MemoryDocument::new();
        let body = doc.body();
        let container = doc
            .append_element(body, &format!(r#"<div id="gists">{}</div>"#, gist("1")))
            .unwrap();
        doc.append_element(body, &gist("2"));

        let sel = Selector::parse("[data-gist-id]").unwrap();
        assert_eq!(doc.query_selector_all(None, &sel).len(), 2);
        assert_eq!(doc.query_selector_all(Some(container), &sel).len(), 1);
        assert_eq!(
            doc.query_selector(&Selector::parse("#gists").unwrap()),
            Some(container)
        );
    }

    #[test]
    fn test_combinators() {
        let doc = MemoryDocument::parse(
            r#"<main><section id="gists"><p><code data-gist-id="1"></code></p></section></main>
<aside id="gists-2"><code data-gist-id="2"></code></aside>"#,
        );
        assert_eq!(select(&doc, "main > #gists").len(), 1);
        assert_eq!(select(&doc, "main #gists code").len(), 1);
        assert_eq!(select(&doc, "section > code").len(), 0);
        assert_eq!(select(&doc, "main code, aside > code").len(), 2);
        assert_eq!(select(&doc, r#"[id^="gists"]"#).len(), 2);
    }

    #[test]
    fn test_inner_html_and_classes() {
        let doc = MemoryDocument::new();
        let el = doc
            .append_element(doc.body(), r#"<code data-gist-id="1">loading &lt;...&gt;</code>"#)
            .unwrap();
        assert_eq!(doc.inner_html(el).as_deref(), Some("loading &lt;...&gt;"));

        doc.set_inner_html(el, "<p>hi</p>");
        doc.add_class(el, "complete");
        doc.add_class(el, "complete");
        assert_eq!(doc.inner_html(el).as_deref(), Some("<p>hi</p>"));
        assert!(doc.has_class(el, "complete"));
        assert_eq!(doc.class_list(el), vec!["complete".to_string()]);
        assert!(!doc.has_class(el, "error"));
    }

    #[test]
    fn test_add_class_keeps_existing() {
        let doc = MemoryDocument::parse(r#"<code class="gist  wide" data-gist-id="1"></code>"#);
        let el = select(&doc, "code")[0];
        doc.add_class(el, "complete");
        assert_eq!(doc.class_list(el), vec!["gist", "wide", "complete"]);
        assert_eq!(select(&doc, "code.gist.complete"), vec![el]);
    }

    #[test]
    fn test_attribute_edits() {
        let doc = MemoryDocument::parse(&gist("1"));
        let el = select(&doc, "code")[0];

        assert!(doc.insert_attribute(el, "data-claimed", ""));
        assert!(!doc.insert_attribute(el, "DATA-CLAIMED", "again"));
        assert_eq!(select(&doc, "code[data-claimed]"), vec![el]);

        doc.set_attribute(el, "data-gist-id", "2");
        assert_eq!(doc.attribute(el, "data-gist-id").as_deref(), Some("2"));

        doc.remove_attribute(el, "data-claimed");
        assert!(select(&doc, "[data-claimed]").is_empty());
        assert_eq!(doc.to_html(), MemoryDocument::parse(&gist("2")).to_html());
    }

    #[test]
    fn test_stylesheet_links() {
        let doc = MemoryDocument::new();
        doc.append_stylesheet("https://assets.example/embed.css");
        assert_eq!(doc.stylesheets(), vec!["https://assets.example/embed.css"]);
        let html = doc.to_html();
        assert!(html.contains(
            r#"<link type="text/css" rel="stylesheet" media="all" href="https://assets.example/embed.css">"#
        ));
        assert!(!html.contains("</link>"));
    }

    #[test]
    fn test_detach_children() {
        let doc =
            MemoryDocument::parse(&format!(r#"<div id="gists">{}{}</div>"#, gist("1"), gist("2")));
        let container = select(&doc, "#gists")[0];
        let markup = doc.detach_children(container).unwrap();
        assert_eq!(markup, format!("{}{}", gist("1"), gist("2")));
        assert!(select(&doc, "[data-gist-id]").is_empty());
        assert_eq!(doc.inner_html(container).as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_child_list_notifications() {
        let doc = MemoryDocument::new();
        let body = doc.body();
        let mut sub = doc.observe_child_list(body).unwrap();
        assert_eq!(doc.observer_count(), 1);

        let added = doc.append_html(body, &format!("{}text{}", gist("1"), gist("2")));
        assert_eq!(added.len(), 2);
        let batch = sub.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].target, body);
        assert_eq!(batch[0].added, added);

        sub.disconnect();
        assert_eq!(doc.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_text_only_insert_notifies() {
        let doc = MemoryDocument::new();
        let body = doc.body();
        let mut sub = doc.observe_child_list(body).unwrap();

        assert!(doc.append_html(body, "just text").is_empty());
        let batch = sub.next_batch().await.unwrap();
        assert!(batch[0].added.is_empty());
    }

    #[test]
    fn test_repeated_rewrites_keep_arena_bounded() {
        let doc = MemoryDocument::parse(&format!(r#"<div id="gists">{}</div>"#, gist("1")));
        let container = select(&doc, "#gists")[0];
        let el = select(&doc, "[data-gist-id]")[0];

        for i in 0..5_000 {
            doc.set_inner_html(el, &format!("<p>rev {i}</p><p>tail</p>"));
        }

        assert!(doc.arena_len() < 2 * COMPACT_THRESHOLD, "{}", doc.arena_len());
        assert_eq!(doc.inner_html(el).as_deref(), Some("<p>rev 4999</p><p>tail</p>"));
        assert_eq!(select(&doc, "#gists"), vec![container]);
        assert_eq!(doc.attribute(el, "data-gist-id").as_deref(), Some("1"));
        doc.add_class(el, "complete");
        assert!(doc.to_html().contains(r#"class="complete""#));
    }

    #[test]
    fn test_unsupported_change_notification() {
        let doc = MemoryDocument::without_change_notification();
        assert!(!doc.supports_change_notification());
        assert!(matches!(
            doc.observe_child_list(doc.body()),
            Err(EmbedError::UnsupportedCapability(_))
        ));
    }
}
