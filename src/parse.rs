use serde_json::{Map, Value};
use tracing::warn;

use crate::models::{CarouselItem, RawPost};

// Keys that may hold the item list, in preference order
const ITEM_KEYS: [&str; 4] = ["edges", "posts", "reels", "items"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub has_next: bool,
    pub cursor: Option<String>,
}

impl Pagination {
    pub fn end() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<RawPost>,
    // nodes without an id or not objects
    pub malformed_items: usize,
    pub next: Pagination,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageError {
    /// The item list is unreadable but the next cursor is known.
    Items { reason: String, next: Pagination },
    /// The pagination boundary cannot be determined.
    Structure(String),
}

impl PageError {
    pub fn reason(&self) -> &str {
        match self {
            PageError::Items { reason, .. } => reason,
            PageError::Structure(reason) => reason,
        }
    }
}

/// Parse one listing response. `previous_cursor` is the cursor this page
/// was requested with, used to catch a listing that stops advancing.
pub fn parse_page(body: &Value, previous_cursor: Option<&str>) -> Result<ListingPage, PageError> {
    let result = match body.get("result") {
        Some(result) => result,
        None => {
            let keys: Vec<&str> = body
                .as_object()
                .map(|o| o.keys().map(|k| k.as_str()).collect())
                .unwrap_or_default();
            return Err(PageError::Structure(format!(
                "no 'result' key in response (keys: {:?})",
                keys
            )));
        }
    };

    match result {
        Value::Array(list) => {
            let (items, malformed_items) = parse_items(list);
            Ok(ListingPage {
                items,
                malformed_items,
                next: Pagination::end(),
            })
        }
        Value::Object(obj) => {
            let next = pagination(obj, previous_cursor);

            let mut list = None;
            for key in ITEM_KEYS {
                match obj.get(key) {
                    Some(Value::Array(items)) if !items.is_empty() => {
                        list = Some(items);
                        break;
                    }
                    Some(Value::Array(_)) | Some(Value::Null) | None => {}
                    Some(other) => {
                        return Err(PageError::Items {
                            reason: format!("'{}' is not a list: {}", key, type_name(other)),
                            next,
                        });
                    }
                }
            }

            match list {
                Some(list) => {
                    let (items, malformed_items) = parse_items(list);
                    Ok(ListingPage {
                        items,
                        malformed_items,
                        next,
                    })
                }
                // nothing listed, nothing more to page through
                None => Ok(ListingPage::default()),
            }
        }
        other => Err(PageError::Structure(format!(
            "unexpected 'result' type: {}",
            type_name(other)
        ))),
    }
}

fn pagination(obj: &Map<String, Value>, previous_cursor: Option<&str>) -> Pagination {
    let (has_next, cursor) = match obj.get("page_info") {
        Some(Value::Object(info)) => (
            info.get("has_next_page")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            string_field(info, &["end_cursor", "maxId"]),
        ),
        _ => {
            let cursor = string_field(obj, &["next_max_id", "maxId"]);
            let has_more = obj.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            (has_more || cursor.is_some(), cursor)
        }
    };

    if !has_next {
        return Pagination::end();
    }
    match cursor {
        None => {
            warn!("Listing advertises another page without a cursor, stopping");
            Pagination::end()
        }
        Some(c) if Some(c.as_str()) == previous_cursor => {
            warn!(cursor = %c, "Listing cursor did not advance, stopping");
            Pagination::end()
        }
        Some(c) => Pagination {
            has_next: true,
            cursor: Some(c),
        },
    }
}

fn parse_items(list: &[Value]) -> (Vec<RawPost>, usize) {
    let mut items = Vec::with_capacity(list.len());
    let mut malformed = 0;
    for entry in list {
        match parse_node(entry) {
            Some(raw) => items.push(raw),
            None => malformed += 1,
        }
    }
    (items, malformed)
}

/// Normalise one listing entry (an edge `{node}` or a bare node). A nested
/// `media` object is merged underneath, node fields winning.
pub fn parse_node(entry: &Value) -> Option<RawPost> {
    let entry = entry.as_object()?;
    let node = match entry.get("node") {
        Some(Value::Object(inner)) => inner,
        _ => entry,
    };
    let media = node.get("media").and_then(Value::as_object);

    let field = |key: &'static str| lookup(node, media, key);

    let id = field("pk").or_else(|| field("id")).and_then(id_string)?;

    let caption = field("caption").and_then(Value::as_object);
    let caption_text = caption
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let caption_created_at = caption
        .and_then(|c| c.get("created_at"))
        .filter(|v| !v.is_null())
        .cloned();

    let play_count = match lenient_int(field("play_count")) {
        0 => lenient_int(field("view_count")),
        n => n,
    };

    let carousel = field("carousel_media")
        .and_then(Value::as_array)
        .map(|children| {
            children
                .iter()
                .enumerate()
                .map(|(index, child)| carousel_item(index, child))
                .collect()
        })
        .unwrap_or_default();

    Some(RawPost {
        id,
        code: field("code").and_then(Value::as_str).map(str::to_string),
        caption: caption_text,
        taken_at: field("taken_at")
            .or_else(|| field("taken_at_timestamp"))
            .cloned(),
        caption_created_at,
        product_type: field("product_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        media_type: field("media_type").and_then(Value::as_i64),
        image_url: image_url(field("image_versions2"))
            .or_else(|| field("display_url").and_then(Value::as_str).map(str::to_string)),
        video_url: first_url(field("video_versions")),
        like_count: lenient_int(field("like_count")),
        comment_count: lenient_int(field("comment_count")),
        play_count,
        carousel_media_count: lenient_int(field("carousel_media_count")).max(0) as u32,
        carousel,
    })
}

fn lookup<'a>(
    node: &'a Map<String, Value>,
    media: Option<&'a Map<String, Value>>,
    key: &str,
) -> Option<&'a Value> {
    node.get(key)
        .filter(|v| !v.is_null())
        .or_else(|| media.and_then(|m| m.get(key)).filter(|v| !v.is_null()))
}

fn carousel_item(index: usize, child: &Value) -> CarouselItem {
    let video_url = first_url(child.get("video_versions"));
    let is_video = video_url.is_some() || child.get("media_type").and_then(Value::as_i64) == Some(2);
    CarouselItem {
        index,
        image_url: image_url(child.get("image_versions2")),
        video_url,
        is_video,
    }
}

// image_versions2.candidates[0].url
fn image_url(versions: Option<&Value>) -> Option<String> {
    first_url(versions?.get("candidates"))
}

fn first_url(list: Option<&Value>) -> Option<String> {
    list?
        .as_array()?
        .first()?
        .get("url")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// Counters arrive as ints, floats, strings or null
fn lenient_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edges_with_page_info() {
        let body = json!({
            "result": {
                "edges": [
                    {"node": {"pk": "111", "code": "A1", "taken_at": 1_700_000_000,
                              "caption": {"text": "hello", "created_at": 1_699_999_990},
                              "like_count": 10, "comment_count": "3"}},
                    {"node": {"code": "no-id"}},
                ],
                "page_info": {"has_next_page": true, "end_cursor": "cursor-2"}
            }
        });

        let page = parse_page(&body, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.malformed_items, 1);
        assert_eq!(page.next.cursor.as_deref(), Some("cursor-2"));
        assert!(page.next.has_next);

        let item = &page.items[0];
        assert_eq!(item.id, "111");
        assert_eq!(item.caption, "hello");
        assert_eq!(item.like_count, 10);
        assert_eq!(item.comment_count, 3);
        assert_eq!(item.taken_at, Some(json!(1_700_000_000)));
        assert_eq!(item.caption_created_at, Some(json!(1_699_999_990)));
    }

    #[test]
    fn test_alternative_list_and_cursor_fields() {
        let body = json!({
            "result": {
                "posts": [{"id": 222, "view_count": 50, "play_count": 0}],
                "next_max_id": "max-9"
            }
        });
        let page = parse_page(&body, None).unwrap();
        assert_eq!(page.items[0].id, "222");
        assert_eq!(page.items[0].play_count, 50);
        assert_eq!(
            page.next,
            Pagination {
                has_next: true,
                cursor: Some("max-9".into())
            }
        );
    }

    #[test]
    fn test_array_result_is_last_page() {
        let body = json!({"result": [{"pk": 1}, {"pk": 2}, 7]});
        let page = parse_page(&body, None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.malformed_items, 1);
        assert!(!page.next.has_next);
    }

    #[test]
    fn test_missing_result_is_structural() {
        let err = parse_page(&json!({"message": "oops"}), None).unwrap_err();
        assert!(matches!(err, PageError::Structure(_)));
        let err = parse_page(&json!({"result": "nope"}), None).unwrap_err();
        assert!(matches!(err, PageError::Structure(_)));
    }

    #[test]
    fn test_unreadable_items_keep_cursor() {
        let body = json!({
            "result": {
                "edges": "broken",
                "page_info": {"has_next_page": true, "end_cursor": "c3"}
            }
        });
        match parse_page(&body, Some("c2")).unwrap_err() {
            PageError::Items { next, .. } => assert_eq!(next.cursor.as_deref(), Some("c3")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stuck_cursor_ends_listing() {
        let body = json!({
            "result": {
                "edges": [{"node": {"pk": "1"}}],
                "page_info": {"has_next_page": true, "end_cursor": "same"}
            }
        });
        let page = parse_page(&body, Some("same")).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.next.has_next);

        let no_cursor = json!({
            "result": {"edges": [{"node": {"pk": "1"}}], "page_info": {"has_next_page": true}}
        });
        assert!(!parse_page(&no_cursor, None).unwrap().next.has_next);
    }

    #[test]
    fn test_nested_media_merges_under_node() {
        let node = json!({
            "node": {
                "taken_at": 1_700_000_100,
                "media": {
                    "pk": "333",
                    "taken_at": 1,
                    "product_type": "clips",
                    "play_count": 900,
                    "video_versions": [{"url": "https://cdn/v.mp4"}],
                    "image_versions2": {"candidates": [{"url": "https://cdn/i.jpg"}]}
                }
            }
        });
        let raw = parse_node(&node).unwrap();
        assert_eq!(raw.id, "333");
        assert_eq!(raw.taken_at, Some(json!(1_700_000_100)));
        assert_eq!(raw.product_type.as_deref(), Some("clips"));
        assert_eq!(raw.play_count, 900);
        assert_eq!(raw.video_url.as_deref(), Some("https://cdn/v.mp4"));
        assert_eq!(raw.image_url.as_deref(), Some("https://cdn/i.jpg"));
    }

    #[test]
    fn test_carousel_children_keep_order() {
        let node = json!({
            "pk": "444",
            "media_type": 8,
            "carousel_media_count": 2,
            "carousel_media": [
                {"image_versions2": {"candidates": [{"url": "https://cdn/0.jpg"}]}},
                {"media_type": 2, "video_versions": [{"url": "https://cdn/1.mp4"}]}
            ]
        });
        let raw = parse_node(&node).unwrap();
        assert_eq!(raw.carousel_media_count, 2);
        assert_eq!(raw.carousel.len(), 2);
        assert_eq!(raw.carousel[0].index, 0);
        assert!(!raw.carousel[0].is_video);
        assert_eq!(raw.carousel[0].image_url.as_deref(), Some("https://cdn/0.jpg"));
        assert_eq!(raw.carousel[1].index, 1);
        assert!(raw.carousel[1].is_video);
    }

    #[test]
    fn test_empty_listing_has_no_next_page() {
        let body = json!({"result": {"edges": [], "page_info": {"has_next_page": true, "end_cursor": "x"}}});
        let page = parse_page(&body, None).unwrap();
        assert!(page.items.is_empty());
        assert!(!page.next.has_next);
    }
}
