//! Source adapters: page-range construction, fragment selection and record extraction per source.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use xtrobe_core::{ImageVariant, PageRef, Record, NO_DESCRIPTION, NO_LINK, NO_TITLE};

pub const CRATE_NAME: &str = "xtrobe-adapters";

pub const SPACE_NEWS: &str = "space-news";
pub const ASTRONOMY: &str = "astronomy";
pub const LAUNCH_SCHEDULE: &str = "launch-schedule";

/// Every source id this crate ships an adapter for, in registry order.
pub const BUILTIN_SOURCES: [&str; 3] = [SPACE_NEWS, ASTRONOMY, LAUNCH_SCHEDULE];

/// Structural failure while turning one fragment into a record. The pipeline logs and skips it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("fragment has no `{0}` node")]
    MissingStructure(&'static str),
}

/// Failure to build the ordered list of pages for a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageRangeError {
    #[error("invalid base url '{url}': {source}")]
    BaseUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("page range {first}..={last} is inverted")]
    Inverted { first: u32, last: u32 },
    #[error("page indexes start at 1")]
    ZeroIndex,
    #[error("source {source_id} has a single page; requested {first}..={last}")]
    NotPaginated {
        source_id: String,
        first: u32,
        last: u32,
    },
}

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn single() -> Self {
        Self { first: 1, last: 1 }
    }

    fn validate(&self) -> Result<(), PageRangeError> {
        if self.first == 0 {
            return Err(PageRangeError::ZeroIndex);
        }
        if self.first > self.last {
            return Err(PageRangeError::Inverted {
                first: self.first,
                last: self.last,
            });
        }
        Ok(())
    }
}

/// One extractable block of markup inside a fetched page. Borrowed from the parsed
/// document, so it cannot outlive the extraction step that produced it.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub position: usize,
    element: ElementRef<'a>,
}

impl<'a> Fragment<'a> {
    pub fn new(position: usize, element: ElementRef<'a>) -> Self {
        Self { position, element }
    }

    pub fn element(&self) -> ElementRef<'a> {
        self.element
    }

    pub fn html(&self) -> String {
        self.element.html()
    }
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn base_url(&self) -> &Url;

    fn default_pages(&self) -> PageRange {
        PageRange::single()
    }

    /// URL of one page of this source.
    fn page_url(&self, index: u32) -> Result<Url, PageRangeError>;

    /// Ordered page references for `range`, in dispatch order.
    fn page_refs(&self, range: PageRange) -> Result<Vec<PageRef>, PageRangeError> {
        range.validate()?;
        (range.first..=range.last)
            .map(|index| {
                self.page_url(index)
                    .map(|url| PageRef::new(self.source_id(), index, url.to_string()))
            })
            .collect()
    }

    /// Locate every fragment of a page in document order. Zero fragments is not an error.
    fn fragments<'a>(&self, document: &'a Html) -> Vec<Fragment<'a>>;

    /// Turn one fragment into a record, using sentinels for missing sub-fields.
    fn extract(&self, fragment: &Fragment<'_>) -> Result<Record, ExtractionFailure>;
}

/// Outcome of extracting every fragment of one page, in document order.
#[derive(Debug, Default)]
pub struct PageExtraction {
    pub outcomes: Vec<Result<Record, ExtractionFailure>>,
}

impl PageExtraction {
    pub fn fragment_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }
}

/// Parse `body`, select its fragments and run the adapter's extractor over each of them.
pub fn extract_page(adapter: &dyn SourceAdapter, body: &str) -> PageExtraction {
    let document = Html::parse_document(body);
    PageExtraction {
        outcomes: adapter
            .fragments(&document)
            .iter()
            .map(|f| adapter.extract(f))
            .collect(),
    }
}

/// Compile one of the adapters' built-in selectors.
fn css(selector: &'static str) -> Selector {
    Selector::parse(selector).expect("built-in selector")
}

fn first<'a>(scope: ElementRef<'a>, sel: &Selector) -> Option<ElementRef<'a>> {
    scope.select(sel).next()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    first(scope, sel).map(element_text)
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    first(scope, sel)
        .and_then(|n| n.value().attr(attr))
        .map(|v| v.trim().to_string())
}

fn select_fragments<'a>(
    scope: impl Iterator<Item = ElementRef<'a>>,
    sel: &Selector,
) -> Vec<Fragment<'a>> {
    scope
        .flat_map(|root| root.select(sel).collect::<Vec<_>>())
        .enumerate()
        .map(|(position, element)| Fragment::new(position, element))
        .collect()
}

fn parse_base(raw: &str) -> Result<Url, PageRangeError> {
    Url::parse(raw).map_err(|source| PageRangeError::BaseUrl {
        url: raw.to_string(),
        source,
    })
}

fn join(base: &Url, path: &str) -> Result<Url, PageRangeError> {
    base.join(path).map_err(|source| PageRangeError::BaseUrl {
        url: format!("{base}{path}"),
        source,
    })
}

/// Resolve a page-relative URL against `base`. Values that cannot be resolved are kept verbatim.
pub fn resolve_url(base: &Url, raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    base.join(raw)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Resolve every candidate of a `srcset`-style list and rejoin them with `", "`.
/// Width/density descriptors stay attached to their candidate.
pub fn resolve_srcset(base: &Url, srcset: &str) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = resolve_url(base, parts.next().unwrap_or_default());
            let descriptor = parts.collect::<Vec<_>>().join(" ");
            if descriptor.is_empty() {
                url
            } else {
                format!("{url} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn resolved_or_sentinel(base: &Url, raw: Option<String>) -> String {
    raw.map(|href| resolve_url(base, &href))
        .filter(|href| !href.is_empty())
        .unwrap_or_else(|| NO_LINK.to_string())
}

#[derive(Debug, Clone)]
struct SpaceNewsSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    strapline: Selector,
    picture: Selector,
    webp: Selector,
    img: Selector,
}

impl SpaceNewsSelectors {
    fn new() -> Self {
        Self {
            item: css("div.feature-block-item-wrapper"),
            title: css("span.article-name"),
            link: css("a.article-link"),
            strapline: css("span.article-strapline"),
            picture: css("picture"),
            webp: css(r#"source[type="image/webp"]"#),
            img: css("img"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpaceNewsAdapter {
    base: Url,
    sel: SpaceNewsSelectors,
}

impl SpaceNewsAdapter {
    pub const DEFAULT_BASE: &'static str = "https://www.space.com";

    pub fn new(base: &str) -> Result<Self, PageRangeError> {
        Ok(Self {
            base: parse_base(base)?,
            sel: SpaceNewsSelectors::new(),
        })
    }

    /// WebP rendition first, then the `<img>` fallback; both empty when the article has no `<picture>`.
    fn images(&self, scope: ElementRef<'_>) -> Vec<ImageVariant> {
        let Some(picture) = first(scope, &self.sel.picture) else {
            return vec![ImageVariant::default(), ImageVariant::default()];
        };

        let webp = first(picture, &self.sel.webp);
        let webp_srcset = webp
            .and_then(|s| s.value().attr("srcset"))
            .map(|s| resolve_srcset(&self.base, s))
            .unwrap_or_default();
        let webp_sizes = webp
            .and_then(|s| s.value().attr("sizes"))
            .unwrap_or_default()
            .to_string();

        let img = first(picture, &self.sel.img);
        let fallback_url = img
            .and_then(|i| i.value().attr("src"))
            .map(|src| resolve_url(&self.base, src))
            .unwrap_or_default();
        let fallback_srcset = img
            .and_then(|i| i.value().attr("srcset"))
            .map(|s| resolve_srcset(&self.base, s))
            .unwrap_or_default();

        vec![
            ImageVariant {
                srcset: webp_srcset,
                sizes: webp_sizes,
                ..Default::default()
            },
            ImageVariant {
                url: fallback_url,
                srcset: fallback_srcset,
                ..Default::default()
            },
        ]
    }
}

impl SourceAdapter for SpaceNewsAdapter {
    fn source_id(&self) -> &'static str {
        SPACE_NEWS
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    fn page_url(&self, index: u32) -> Result<Url, PageRangeError> {
        if index != 1 {
            return Err(PageRangeError::NotPaginated {
                source_id: SPACE_NEWS.to_string(),
                first: index,
                last: index,
            });
        }
        Ok(self.base.clone())
    }

    fn fragments<'a>(&self, document: &'a Html) -> Vec<Fragment<'a>> {
        select_fragments(std::iter::once(document.root_element()), &self.sel.item)
    }

    fn extract(&self, fragment: &Fragment<'_>) -> Result<Record, ExtractionFailure> {
        let scope = fragment.element();
        let mut record = Record::placeholder(SPACE_NEWS);

        if let Some(title) = first_text(scope, &self.sel.title) {
            record.title = title;
        }
        record.link = resolved_or_sentinel(&self.base, first_attr(scope, &self.sel.link, "href"));
        if let Some(description) = first_text(scope, &self.sel.strapline) {
            record.description = description;
        }
        record.images = self.images(scope);
        Ok(record)
    }
}

#[derive(Debug, Clone)]
struct AstronomySelectors {
    item: Selector,
    heading: Selector,
    date: Selector,
    anchor: Selector,
    paragraph: Selector,
    img: Selector,
    large_link: Selector,
}

impl AstronomySelectors {
    fn new() -> Self {
        Self {
            item: css("article.post-row"),
            heading: css("h3"),
            date: css("span.text-color-link--active"),
            anchor: css("a"),
            paragraph: css("p"),
            img: css("img"),
            large_link: css("p.large-link"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AstronomyAdapter {
    base: Url,
    sel: AstronomySelectors,
}

impl AstronomyAdapter {
    pub const DEFAULT_BASE: &'static str = "https://www.timeanddate.com";
    const LISTING_PATH: &'static str = "/astronomy/sights-to-see.html";

    pub fn new(base: &str) -> Result<Self, PageRangeError> {
        Ok(Self {
            base: parse_base(base)?,
            sel: AstronomySelectors::new(),
        })
    }
}

impl SourceAdapter for AstronomyAdapter {
    fn source_id(&self) -> &'static str {
        ASTRONOMY
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    fn page_url(&self, index: u32) -> Result<Url, PageRangeError> {
        if index != 1 {
            return Err(PageRangeError::NotPaginated {
                source_id: ASTRONOMY.to_string(),
                first: index,
                last: index,
            });
        }
        join(&self.base, Self::LISTING_PATH)
    }

    fn fragments<'a>(&self, document: &'a Html) -> Vec<Fragment<'a>> {
        select_fragments(std::iter::once(document.root_element()), &self.sel.item)
    }

    fn extract(&self, fragment: &Fragment<'_>) -> Result<Record, ExtractionFailure> {
        let scope = fragment.element();
        // Every sighting hangs off its heading; without one the block is not an entry.
        let heading =
            first(scope, &self.sel.heading).ok_or(ExtractionFailure::MissingStructure("h3"))?;

        let mut record = Record::placeholder(ASTRONOMY);
        let event_date =
            first_text(heading, &self.sel.date).unwrap_or_else(|| "No Date".to_string());

        if let Some(anchor) = first(heading, &self.sel.anchor) {
            record.title = element_text(anchor);
            record.link = resolved_or_sentinel(
                &self.base,
                anchor.value().attr("href").map(ToString::to_string),
            );
        }
        if let Some(description) = first_text(scope, &self.sel.paragraph) {
            record.description = description;
        }

        let img = first(scope, &self.sel.img);
        record.images = vec![ImageVariant {
            url: img
                .and_then(|i| i.value().attr("src"))
                .map(|src| resolve_url(&self.base, src))
                .unwrap_or_default(),
            alt: img
                .and_then(|i| i.value().attr("alt"))
                .unwrap_or("No Image Description")
                .to_string(),
            ..Default::default()
        }];

        let extra_link = match first(scope, &self.sel.large_link) {
            Some(p) => resolved_or_sentinel(&self.base, first_attr(p, &self.sel.anchor, "href")),
            None => NO_LINK.to_string(),
        };

        Ok(record
            .with_extra("eventDate", event_date)
            .with_extra("extraLink", extra_link))
    }
}

#[derive(Debug, Clone)]
struct LaunchScheduleSelectors {
    main: Selector,
    item: Selector,
    title: Selector,
    title_link: Selector,
    info: Selector,
    location: Selector,
    time: Selector,
    go_for_launch: Selector,
    thumbnail: Selector,
}

impl LaunchScheduleSelectors {
    fn new() -> Self {
        Self {
            main: css("main.site-main"),
            item: css("article"),
            title: css("h2.entry-title"),
            title_link: css("h2.entry-title a"),
            info: css("h3.h6"),
            location: css("div.col.h6.mb-0.pt-2"),
            time: css("time.launchDateTime"),
            go_for_launch: css("div.col.h6.mb-1.pt-1.text-uppercase"),
            thumbnail: css("a.launch-list-thumbnail"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchScheduleAdapter {
    base: Url,
    pages: PageRange,
    sel: LaunchScheduleSelectors,
}

impl LaunchScheduleAdapter {
    pub const DEFAULT_BASE: &'static str = "https://www.spacelaunchschedule.com";
    pub const DEFAULT_PAGES: u32 = 3;

    pub fn new(base: &str) -> Result<Self, PageRangeError> {
        Ok(Self {
            base: parse_base(base)?,
            pages: PageRange::new(1, Self::DEFAULT_PAGES),
            sel: LaunchScheduleSelectors::new(),
        })
    }

    pub fn with_pages(mut self, pages: PageRange) -> Self {
        self.pages = pages;
        self
    }
}

impl SourceAdapter for LaunchScheduleAdapter {
    fn source_id(&self) -> &'static str {
        LAUNCH_SCHEDULE
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    fn default_pages(&self) -> PageRange {
        self.pages
    }

    fn page_url(&self, index: u32) -> Result<Url, PageRangeError> {
        if index == 0 {
            return Err(PageRangeError::ZeroIndex);
        }
        join(&self.base, &format!("/page/{index}/"))
    }

    fn fragments<'a>(&self, document: &'a Html) -> Vec<Fragment<'a>> {
        select_fragments(document.select(&self.sel.main).take(1), &self.sel.item)
    }

    fn extract(&self, fragment: &Fragment<'_>) -> Result<Record, ExtractionFailure> {
        let scope = fragment.element();
        let mut record = Record::placeholder(LAUNCH_SCHEDULE);

        if let Some(title) = first_text(scope, &self.sel.title) {
            record.title = title;
        }
        record.link = resolved_or_sentinel(&self.base, first_attr(scope, &self.sel.title_link, "href"));

        let launch_info = first_text(scope, &self.sel.info);
        if let Some(info) = &launch_info {
            record.description = info.clone();
        }
        let location = first_text(scope, &self.sel.location)
            .unwrap_or_else(|| "No location".to_string());
        let launch_time = first_attr(scope, &self.sel.time, "datetime")
            .unwrap_or_else(|| "No launch time".to_string());
        let go_for_launch = first_text(scope, &self.sel.go_for_launch).unwrap_or_default();

        record.images = vec![ImageVariant {
            url: first_attr(scope, &self.sel.thumbnail, "data-ezbg")
                .map(|src| resolve_url(&self.base, &src))
                .unwrap_or_default(),
            ..Default::default()
        }];

        Ok(record
            .with_extra(
                "launchInfo",
                launch_info.unwrap_or_else(|| "No launch info".to_string()),
            )
            .with_extra("location", location)
            .with_extra("launchTime", launch_time)
            .with_extra("goForLaunch", go_for_launch))
    }
}

/// Adapter for a built-in source at its public base URL.
pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    let base = match source_id {
        SPACE_NEWS => SpaceNewsAdapter::DEFAULT_BASE,
        ASTRONOMY => AstronomyAdapter::DEFAULT_BASE,
        LAUNCH_SCHEDULE => LaunchScheduleAdapter::DEFAULT_BASE,
        _ => return None,
    };
    adapter_with_base(source_id, base, None).ok().flatten()
}

/// Adapter for a built-in source pointed at `base`, optionally with a different default page range.
pub fn adapter_with_base(
    source_id: &str,
    base: &str,
    pages: Option<PageRange>,
) -> Result<Option<Box<dyn SourceAdapter>>, PageRangeError> {
    let adapter: Box<dyn SourceAdapter> = match source_id {
        SPACE_NEWS => Box::new(SpaceNewsAdapter::new(base)?),
        ASTRONOMY => Box::new(AstronomyAdapter::new(base)?),
        LAUNCH_SCHEDULE => {
            let adapter = LaunchScheduleAdapter::new(base)?;
            Box::new(match pages {
                Some(pages) => adapter.with_pages(pages),
                None => adapter,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(adapter))
}
