//! Upstream origin access
//!
//! The fetcher only needs "give me the bytes of channel N, optionally from
//! byte k on". `UpstreamSource` is that seam; `HttpUpstream` is the real
//! implementation on top of reqwest.

use std::future::Future;

use bytes::Bytes;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::RANGE;
use reqwest::{redirect, StatusCode, Url};

use crate::error::{Error, Result};
use crate::registry::ChannelName;

use super::config::UpstreamConfig;

/// Body of an upstream response, delivered chunk by chunk
pub type UpstreamBody = BoxStream<'static, Result<Bytes>>;

/// Something the fetcher can pull channel bytes from
pub trait UpstreamSource: Send + Sync + 'static {
    /// Open a streaming fetch of `channel`
    ///
    /// With `resume_from`, the body must start at that byte offset of the
    /// channel's current transmission.
    fn open(
        &self,
        channel: &ChannelName,
        resume_from: Option<u64>,
    ) -> impl Future<Output = Result<UpstreamBody>> + Send;
}

/// HTTP origin: `GET <origin>/<channel>` with `Range` for resumes
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    origin: Url,
}

impl HttpUpstream {
    /// Build an HTTP upstream from configuration
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut origin = config.origin.clone();
        if !origin.ends_with('/') {
            origin.push('/');
        }
        let origin = Url::parse(&origin)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", config.origin, e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(redirect::Policy::limited(10))
            .build()?;

        Ok(Self { client, origin })
    }

    /// Origin base URL
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// URL a channel is fetched from
    pub fn url_for(&self, channel: &ChannelName) -> Result<Url> {
        self.origin
            .join(channel.as_str())
            .map_err(|e| Error::InvalidUrl(format!("{}{}: {}", self.origin, channel, e)))
    }
}

impl UpstreamSource for HttpUpstream {
    async fn open(&self, channel: &ChannelName, resume_from: Option<u64>) -> Result<UpstreamBody> {
        let url = self.url_for(channel)?;

        let mut request = self.client.get(url.clone());
        if let Some(offset) = resume_from {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        tracing::debug!(
            channel = %channel,
            url = %url,
            status = status.as_u16(),
            resume_from = ?resume_from,
            "Upstream responded"
        );

        if let Some(offset) = resume_from {
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Err(Error::RangeNotSatisfiable(offset));
            }
        }
        if !status.is_success() {
            return Err(Error::UpstreamStatus(status.as_u16()));
        }

        let body = response.bytes_stream().map_err(Error::from).boxed();

        // An origin that ignores Range sends the whole transmission again
        match resume_from {
            Some(offset) if offset > 0 && status != StatusCode::PARTIAL_CONTENT => {
                tracing::debug!(
                    channel = %channel,
                    offset = offset,
                    "Origin ignored range request, skipping prefix"
                );
                Ok(skip_prefix(body, offset))
            }
            _ => Ok(body),
        }
    }
}

/// Drop the first `skip` bytes of a body
pub(crate) fn skip_prefix(body: UpstreamBody, mut skip: u64) -> UpstreamBody {
    body.filter_map(move |item| {
        let item = match item {
            Ok(chunk) if skip >= chunk.len() as u64 => {
                skip -= chunk.len() as u64;
                None
            }
            Ok(chunk) => {
                let rest = chunk.slice(skip as usize..);
                skip = 0;
                Some(Ok(rest))
            }
            Err(e) => Some(Err(e)),
        };
        future::ready(item)
    })
    .boxed()
}
