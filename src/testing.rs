//! Test doubles: a plain-text geo database and a throwaway HTTP file server.

use crate::{database::GeoReader, Result};
use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, header, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ipnetwork::IpNetwork;
use std::{
    collections::HashMap,
    convert::Infallible,
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{net::TcpListener, task::JoinHandle};

pub const TEXT_DB_HEADER: &str = "# geogate-text";

/// Renders a text database file body.
pub fn text_db(entries: &[(&str, &str)]) -> String {
    let mut body = format!("{TEXT_DB_HEADER}\n");
    for (network, record) in entries {
        body.push_str(&format!("{network} {record}\n"));
    }
    body
}

struct TextInner {
    entries: Vec<(IpNetwork, String)>,
    closed: AtomicBool,
    closes: AtomicUsize,
    lookups: AtomicUsize,
}

/// Line-oriented stand-in for a binary geo database:
/// a header line followed by `<network> <record>` lines.
///
/// Clones share state, so a test can keep a probe on a reader after handing
/// it to a [`crate::DatabaseHandle`].
#[derive(Clone)]
pub struct TextReader {
    inner: Arc<TextInner>,
}

impl TextReader {
    pub fn from_entries(entries: &[(&str, &str)]) -> Self {
        Self::parse(&text_db(entries)).unwrap()
    }

    fn parse(body: &str) -> Result<Self> {
        let mut lines = body.lines();
        ensure!(
            lines.next().map(str::trim) == Some(TEXT_DB_HEADER),
            "not a geogate text database"
        );

        let entries = lines
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (network, record) = line
                    .trim()
                    .split_once(' ')
                    .with_context(|| format!("malformed line {line:?}"))?;
                anyhow::Ok((network.parse::<IpNetwork>()?, record.to_owned()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(TextInner {
                entries,
                closed: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
                lookups: AtomicUsize::new(0),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.inner.lookups.load(Ordering::SeqCst)
    }
}

impl GeoReader for TextReader {
    type Record = String;

    fn open(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&body)
    }

    fn lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        if self.is_closed() {
            bail!("database is closed");
        }
        self.inner.lookups.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .inner
            .entries
            .iter()
            .find(|(network, _)| network.contains(ip))
            .map(|(_, record)| record.clone()))
    }

    fn close(self) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A file served by [`FileServer`].
#[derive(Clone)]
pub struct Served {
    pub body: Bytes,
    pub last_modified: Option<String>,
}

impl Served {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            last_modified: None,
        }
    }

    pub fn last_modified(mut self, value: impl Into<String>) -> Self {
        self.last_modified = Some(value.into());
        self
    }
}

type Files = Arc<Mutex<HashMap<String, Served>>>;

/// Serves bodies by path over HTTP/1; unknown paths get a 404. Files can be
/// replaced or removed while the server runs.
pub struct FileServer {
    addr: SocketAddr,
    files: Files,
    task: JoinHandle<()>,
}

impl FileServer {
    pub async fn start(files: Vec<(&str, Served)>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let files: Files = Arc::new(Mutex::new(
            files
                .into_iter()
                .map(|(path, served)| (path.to_owned(), served))
                .collect(),
        ));

        let shared = files.clone();
        let task = tokio::spawn(async move {
            let files = shared;
            while let Ok((stream, _)) = listener.accept().await {
                let files = files.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let files = files.clone();
                        async move {
                            let served = files.lock().unwrap().get(request.uri().path()).cloned();
                            Ok::<_, Infallible>(respond(served, &request))
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Self { addr, files, task })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(&self, path: &str, served: Served) {
        self.files.lock().unwrap().insert(path.to_owned(), served);
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(served: Option<Served>, request: &Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(served) = served else {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    };

    let body = if request.method() == Method::HEAD {
        Bytes::new()
    } else {
        served.body.clone()
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(last_modified) = &served.last_modified {
        builder = builder.header(header::LAST_MODIFIED, last_modified.as_str());
    }

    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
