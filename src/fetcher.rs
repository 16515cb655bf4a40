use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::DeviceEndpoint;
use crate::error::{FetchError, PollError};
use crate::session::{DigestSession, HttpResponse};

/// The pages of the AiSEG2 web UI the bridge reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageId {
    /// Today's usage / purchased / sold / generated totals.
    Totals,
    /// One screen of the per-circuit list, 1-based.
    Circuits(u32),
    /// Settings screen embedding the temperature/humidity sensor list.
    Climate,
    /// Landing page, used to leave settings mode.
    Home,
}

impl PageId {
    pub fn path(&self) -> String {
        match self {
            PageId::Totals => "/page/graph/51111".to_string(),
            PageId::Circuits(page) => format!("/page/graph/52111?page={page}"),
            PageId::Climate => "/page/setting/basic/72i41?page=72i4&request_by_form=1".to_string(),
            PageId::Home => "/page/myhome/9".to_string(),
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageId::Totals => write!(f, "totals"),
            PageId::Circuits(page) => write!(f, "circuits#{page}"),
            PageId::Climate => write!(f, "climate"),
            PageId::Home => write!(f, "home"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HtmlDocument {
    pub page: PageId,
    pub body: String,
}

/// Fetches one page over an established session and classifies the outcome.
pub async fn fetch(session: &mut DigestSession, page: PageId) -> Result<HtmlDocument, PollError> {
    let response = session.request(&page.path()).await?;
    into_document(page, response)
}

fn into_document(page: PageId, response: HttpResponse) -> Result<HtmlDocument, PollError> {
    if response.status != 200 {
        return Err(FetchError::UnexpectedStatus(response.status).into());
    }
    if response.body.trim().is_empty() {
        return Err(FetchError::Malformed(format!("empty body for {page}")).into());
    }
    let declared_html = response
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().contains("html"))
        .unwrap_or(false);
    if !declared_html && !response.body.contains('<') {
        return Err(FetchError::Malformed(format!("{page} is not HTML")).into());
    }
    Ok(HtmlDocument {
        page,
        body: response.body,
    })
}

/// Where the poll orchestrator gets its pages from.
#[async_trait]
pub trait PageSource: Send {
    /// Called once at the start of every poll cycle.
    fn begin_cycle(&mut self);

    async fn fetch(&mut self, page: PageId) -> Result<HtmlDocument, PollError>;

    /// Drops any session state, e.g. after cancellation.
    fn discard_session(&mut self);
}

/// The real AiSEG2, reached through a lazily built digest session.
pub struct DeviceClient {
    endpoint: DeviceEndpoint,
    request_timeout: Duration,
    session: Option<DigestSession>,
}

impl DeviceClient {
    pub fn new(endpoint: DeviceEndpoint, request_timeout: Duration) -> Self {
        Self {
            endpoint,
            request_timeout,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut DigestSession, PollError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                info!("Opening session to AiSEG2 at {}", self.endpoint.host);
                DigestSession::authenticate(&self.endpoint, self.request_timeout)?
            }
        };
        Ok(self.session.insert(session))
    }
}

#[async_trait]
impl PageSource for DeviceClient {
    fn begin_cycle(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.begin_cycle();
        }
    }

    async fn fetch(&mut self, page: PageId) -> Result<HtmlDocument, PollError> {
        let session = self.session()?;
        debug!("Fetching {} ({})", page, page.path());
        fetch(session, page).await
    }

    fn discard_session(&mut self) {
        if self.session.take().is_some() {
            debug!("Discarded AiSEG2 session");
        }
    }
}
