//! Per-marketplace extraction rule tables.
//!
//! Each field has an ordered list of rules. The first rule yielding a non-empty value wins;
//! later rules only cover older or alternative page templates.

use flatwatch_core::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Text of the first element matching the selector.
    Text(&'static str),
    /// Attribute of the first element matching the selector.
    Attr(&'static str, &'static str),
    /// Value of a key/value row whose text contains `label` but none of `exclude`.
    Labeled {
        items: &'static str,
        label: &'static str,
        exclude: &'static [&'static str],
    },
    /// First capture group of a regex applied to the fragment text.
    Pattern(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct SourceRules {
    pub source: Source,
    /// Result-card selectors; the first one matching anything on the page is used.
    pub cards: &'static [&'static str],
    pub link: &'static [Rule],
    pub id: &'static [Rule],
    /// Regexes over the listing URL whose first capture is the marketplace id.
    pub id_from_url: &'static [&'static str],
    pub id_prefix: Option<&'static str>,
    pub strip_query: bool,
    pub title: &'static [Rule],
    pub price: &'static [Rule],
    pub size: &'static [Rule],
    pub rooms: &'static [Rule],
    pub location: &'static [Rule],
    pub description: &'static [Rule],
    /// Elements whose text is inspected for the posting date.
    pub date: &'static [&'static str],
}

const SIZE_PATTERN: &str = r"(\d[\d.,]*)\s*(?:m²|m2|qm)";
const PRICE_PATTERN: &str = r"(\d[\d.,\x{a0}]*)\s*€";

pub static KLEINANZEIGEN: SourceRules = SourceRules {
    source: Source::Kleinanzeigen,
    cards: &["article.aditem", "li.ad-listitem article"],
    link: &[
        Rule::Attr("h2 a", "href"),
        Rule::Attr("a[href*='/s-anzeige/']", "href"),
        Rule::Attr("article.aditem", "data-href"),
    ],
    id: &[Rule::Attr("[data-adid]", "data-adid")],
    id_from_url: &[r"/s-anzeige/[^/]+/(\d+)-", r"/(\d{6,})-"],
    id_prefix: None,
    strip_query: false,
    title: &[
        Rule::Text("h1#viewad-title"),
        Rule::Text("h2 a"),
        Rule::Text("h2"),
        Rule::Text("h1"),
    ],
    price: &[
        Rule::Text(".aditem-main--middle--price-shipping--price"),
        Rule::Text("#viewad-price"),
        Rule::Text(".boxedarticle--price"),
        Rule::Text(".price-label"),
        Rule::Pattern(PRICE_PATTERN),
    ],
    size: &[
        Rule::Labeled {
            items: "li.addetailslist--detail, dt",
            label: "wohnfläche",
            exclude: &[],
        },
        Rule::Pattern(SIZE_PATTERN),
    ],
    rooms: &[
        Rule::Labeled {
            items: "li.addetailslist--detail, dt",
            label: "zimmer",
            exclude: &["schlafzimmer", "badezimmer"],
        },
        Rule::Pattern(r"(\d+(?:[.,]\d+)?)\s*(?:Zi\.|Zimmer)"),
        Rule::Pattern(r"(?i)Zimmer\s+(\d+(?:[.,]\d+)?)"),
    ],
    location: &[
        Rule::Text(".aditem-main--top--left"),
        Rule::Text("#viewad-locality"),
    ],
    description: &[
        Rule::Text(".aditem-main--middle--description"),
        Rule::Text("#viewad-description-text"),
        Rule::Text(".addetailslist--description"),
        Rule::Text(".adview--description"),
    ],
    date: &[
        "#viewad-extra-info",
        ".aditem-main--top--right",
        ".aditem-details--top--right",
        ".aditem-addon",
        ".ad-keyfacts",
    ],
};

pub static IMMOWELT: SourceRules = SourceRules {
    source: Source::Immowelt,
    cards: &[
        "div[data-testid='serp-core-classified-card-testid']",
        "div.EstateItem",
    ],
    link: &[
        Rule::Attr("a[data-testid='card-mfe-covering-link-testid']", "href"),
        Rule::Attr("a[href*='/expose/']", "href"),
    ],
    id: &[Rule::Attr("[data-estateid]", "data-estateid")],
    id_from_url: &[r"/expose/([A-Za-z0-9]+)"],
    id_prefix: Some("immowelt_"),
    strip_query: true,
    title: &[
        Rule::Text("h1[data-test='expose-title']"),
        Rule::Attr("a[data-testid='card-mfe-covering-link-testid']", "title"),
        Rule::Text("h2"),
        Rule::Text("h1"),
    ],
    price: &[
        Rule::Text("[data-testid='cardmfe-price-testid']"),
        Rule::Text("div[data-test='price'] strong"),
        Rule::Text("strong[data-test='kaltmiete']"),
        Rule::Text(".hardfact_value strong"),
        Rule::Text(".price_value"),
        Rule::Pattern(PRICE_PATTERN),
    ],
    size: &[
        Rule::Labeled {
            items: "div[data-test='hardfact'], sd-cell",
            label: "m²",
            exclude: &[],
        },
        Rule::Pattern(SIZE_PATTERN),
    ],
    rooms: &[
        Rule::Labeled {
            items: "div[data-test='hardfact'], sd-cell",
            label: "zimmer",
            exclude: &["schlafzimmer", "badezimmer"],
        },
        Rule::Pattern(r"(\d+(?:[.,]\d+)?)\s*(?:Zi\.|Zimmer)"),
    ],
    location: &[
        Rule::Text("[data-testid='cardmfe-description-box-address']"),
        Rule::Text("div[data-test='address']"),
        Rule::Text("span.location"),
        Rule::Text(".expose_header .address"),
        Rule::Text("p.address"),
    ],
    description: &[
        Rule::Text("[data-testid='cardmfe-description-box-text']"),
        Rule::Text("div[data-test='description-text']"),
        Rule::Text("div.freitext"),
        Rule::Text("pre#objectDescription"),
        Rule::Text("div.beschreibung"),
    ],
    date: &["div[data-test='objectdata'] span", ".hardfact", ".objektdaten"],
};

pub static IMMOSCOUT: SourceRules = SourceRules {
    source: Source::Immoscout,
    cards: &["li.result-list__listing", "article[data-obid]"],
    link: &[
        Rule::Attr("a.result-list-entry__brand-title-container", "href"),
        Rule::Attr("a[href*='/expose/']", "href"),
    ],
    id: &[
        Rule::Attr("article[data-obid]", "data-obid"),
        Rule::Attr("li[data-id]", "data-id"),
    ],
    id_from_url: &[r"/expose/(\d+)"],
    id_prefix: Some("immoscout_"),
    strip_query: true,
    title: &[
        Rule::Text("h1#expose-title"),
        Rule::Text("h2"),
        Rule::Text("h1.font-nowrap"),
        Rule::Text("h1"),
    ],
    price: &[
        Rule::Labeled {
            items: "dl",
            label: "kaltmiete",
            exclude: &[],
        },
        Rule::Text("dd[class*='price']"),
        Rule::Text("div[class*='price']"),
        Rule::Text("span[class*='price']"),
        Rule::Pattern(PRICE_PATTERN),
    ],
    size: &[
        Rule::Labeled {
            items: "dl",
            label: "wohnfläche",
            exclude: &[],
        },
        Rule::Pattern(SIZE_PATTERN),
    ],
    rooms: &[
        Rule::Labeled {
            items: "dl",
            label: "zi.",
            exclude: &[],
        },
        Rule::Pattern(r"(\d+(?:[.,]\d+)?)\s*(?:Zi\.|Zimmer)"),
    ],
    location: &[
        Rule::Text("button.result-list-entry__map-link"),
        Rule::Text("div.result-list-entry__address"),
        Rule::Text("span[class*='address']"),
        Rule::Text("div[class*='address']"),
        Rule::Text("dd[class*='address']"),
    ],
    description: &[
        Rule::Text("pre[class*='description']"),
        Rule::Text("div[class*='description']"),
        Rule::Text("p[class*='description']"),
    ],
    date: &["[class*='online-since']", "[class*='date']"],
};

pub fn rules_for(source: Source) -> &'static SourceRules {
    match source {
        Source::Kleinanzeigen => &KLEINANZEIGEN,
        Source::Immowelt => &IMMOWELT,
        Source::Immoscout => &IMMOSCOUT,
    }
}
