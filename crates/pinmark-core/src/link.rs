//! Share links.
//!
//! A session is shared as the viewer page URL with the image id in the query
//! string: `https://host/view?id=abc`.

use url::Url;

/// Query key carrying the image id.
const ID_PARAM: &str = "id";

/// Build the share link for `id` on top of the page URL `base`.
///
/// Any existing query or fragment on `base` is replaced.
pub fn share_link(base: &str, id: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.set_fragment(None);
    url.set_query(None);
    url.query_pairs_mut().append_pair(ID_PARAM, id);
    Ok(url.into())
}

/// Extract the image id from a share link.
///
/// Looks at the query string first, then a `#id=` fragment.
pub fn session_id_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.query_pairs()
        .find(|(key, value)| key == ID_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned())
        .or_else(|| url.fragment().and_then(id_from_fragment))
}

fn id_from_fragment(fragment: &str) -> Option<String> {
    fragment.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == ID_PARAM && !value.is_empty()).then(|| value.to_string())
    })
}
