use log::debug;
use scraper::{ElementRef, Html, Selector};

use crate::client::RawResponse;
use crate::error::{PipelineError, Result};
use crate::record::{FieldKind, FieldValue, Job, Record, RecordSchema};

/// Turns a `thing` API body into a [`Record`] for one schema.
///
/// The XML is read with an HTML5 parser, which is lenient: there is no
/// parse failure, only found or not found. Self-closing tags such as
/// `<minplayers value="2"/>` nest their siblings, so every lookup is a
/// descendant query from the item.
pub struct RecordParser {
    schema: RecordSchema,
    item: Selector,
    link: Selector,
    fields: Vec<Option<Selector>>,
}

impl RecordParser {
    pub fn new(schema: RecordSchema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| match f.kind {
                FieldKind::Value(sel) | FieldKind::Text(sel) => compile(sel).map(Some),
                FieldKind::ItemAttr(_) | FieldKind::Links(_) => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RecordParser {
            schema,
            item: compile("item")?,
            link: compile("link")?,
            fields,
        })
    }

    /// `None` when the body has no `<item>`: the id is valid but the API
    /// has nothing for it.
    pub fn parse(&self, raw: &RawResponse, job: &Job) -> Option<Record> {
        let document = Html::parse_document(&raw.text());
        let item = self.locate_item(&document, &job.external_id)?;

        let values = self
            .schema
            .fields()
            .iter()
            .zip(&self.fields)
            .map(|(spec, selector)| match (spec.kind, selector) {
                (FieldKind::ItemAttr(attr), _) => {
                    FieldValue::Text(item.value().attr(attr).unwrap_or_default().to_string())
                }
                (FieldKind::Links(link_type), _) => {
                    FieldValue::List(self.links_of(item, link_type))
                }
                (FieldKind::Value(_), Some(sel)) => FieldValue::Text(
                    item.select(sel)
                        .next()
                        .and_then(|el| el.value().attr("value"))
                        .unwrap_or_default()
                        .to_string(),
                ),
                (FieldKind::Text(_), Some(sel)) => FieldValue::Text(
                    item.select(sel).next().map(description_text).unwrap_or_default(),
                ),
                (kind, None) => FieldValue::empty_for(&kind),
            })
            .collect();

        Some(Record {
            id: job.external_id.clone(),
            name: job.label.clone(),
            values,
        })
    }

    fn locate_item<'a>(&self, document: &'a Html, id: &str) -> Option<ElementRef<'a>> {
        let mut first = None;
        for item in document.select(&self.item) {
            if item.value().attr("id") == Some(id) {
                return Some(item);
            }
            first.get_or_insert(item);
        }
        if first.is_none() {
            debug!("No item element for game {}", id);
        }
        first
    }

    fn links_of(&self, item: ElementRef<'_>, link_type: &str) -> Vec<String> {
        item.select(&self.link)
            .filter(|link| link.value().attr("type") == Some(link_type))
            .map(|link| link.value().attr("value").unwrap_or_default().to_string())
            .collect()
    }
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| PipelineError::Selector(format!("{selector}: {e}")))
}

/// Own text of the element, with the API's second layer of escaping
/// (`&amp;#10;`) decoded and line breaks flattened.
fn description_text(element: ElementRef<'_>) -> String {
    let text: String = element.text().collect();
    decode_entities(&text)
        .replace('\n', " ")
        .replace('\r', "")
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    // Keep literal '<' as text instead of letting the fragment parser eat it.
    let escaped = text.replace('<', "&lt;");
    Html::parse_fragment(&escaped).root_element().text().collect()
}
