//! [`ObjectStorageClient`] over HTTP, speaking the S3 REST dialect.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::client::{ObjectBody, ObjectHead, ObjectStorageClient, Tags};
use super::sigv4::{self, Signer, SigningRequest, EMPTY_PAYLOAD_SHA256, UNSIGNED_PAYLOAD};
use crate::error::{BackendError, BackendResult};
use crate::tier::{RestoreStatus, StorageClass};

const S3_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Access credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Credentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN` from the environment.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok()?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok()?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Connection settings for [`HttpObjectStorage`].
#[derive(Clone, Debug)]
pub struct HttpStorageConfig {
    pub endpoint: Url,
    pub region: String,
    pub credentials: Credentials,
    /// Address buckets as `endpoint/bucket/key` instead of
    /// `bucket.endpoint/key`.
    pub path_style: bool,
    pub connect_timeout: Duration,
    /// Extra attempts for requests that can be replayed.
    pub max_retries: u32,
}

enum Payload {
    Empty,
    Xml(String),
    Stream(ObjectBody),
}

impl Payload {
    fn replayable(&self) -> bool {
        !matches!(self, Payload::Stream(_))
    }
}

/// Blocking S3-dialect client with SigV4 request signing.
#[derive(Debug)]
pub struct HttpObjectStorage {
    http: Client,
    config: HttpStorageConfig,
}

impl HttpObjectStorage {
    pub fn new(config: HttpStorageConfig) -> BackendResult<Self> {
        if config.endpoint.host_str().is_none() {
            return Err(BackendError::Config(format!(
                "endpoint {} has no host",
                config.endpoint
            )));
        }
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            // Uploads and downloads of media can run for a long time.
            .timeout(None)
            .build()
            .map_err(|e| BackendError::Config(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// The URL and canonical path for a bucket or object.
    fn locate(&self, bucket: &str, key: Option<&str>) -> BackendResult<(Url, String)> {
        let mut url = self.config.endpoint.clone();
        let encoded_key = key.map(|k| sigv4::uri_encode(k, true)).unwrap_or_default();
        let path = if self.config.path_style {
            match key {
                Some(_) => format!("/{}/{encoded_key}", sigv4::uri_encode(bucket, false)),
                None => format!("/{}", sigv4::uri_encode(bucket, false)),
            }
        } else {
            let host = url.host_str().unwrap_or_default().to_string();
            url.set_host(Some(&format!("{bucket}.{host}")))
                .map_err(|e| BackendError::Config(format!("bucket host {bucket}.{host}: {e}")))?;
            format!("/{encoded_key}")
        };
        url.set_path(&path);
        Ok((url, path))
    }

    fn send(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, String)],
        extra_headers: &[(&str, String)],
        mut payload: Payload,
    ) -> BackendResult<Response> {
        let (mut url, canonical_uri) = self.locate(bucket, key)?;
        let canonical_query = sigv4::canonical_query(query);
        url.set_query((!canonical_query.is_empty()).then_some(canonical_query.as_str()));

        let attempts = if payload.replayable() {
            self.config.max_retries + 1
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let body = std::mem::replace(&mut payload, Payload::Empty);
            let (request_body, keep) = match body {
                Payload::Xml(xml) => (Some(Body::from(xml.clone())), Payload::Xml(xml)),
                Payload::Stream(object) => (
                    Some(Body::sized(object.reader, object.len)),
                    Payload::Empty,
                ),
                Payload::Empty => (None, Payload::Empty),
            };
            payload = keep;

            let headers = self.signed_headers(
                &method,
                &url,
                &canonical_uri,
                &canonical_query,
                extra_headers,
                &payload_hash_for(&payload, request_body.is_some()),
            );
            let mut request = self.http.request(method.clone(), url.clone());
            for (name, value) in &headers {
                if name != "host" {
                    request = request.header(name.as_str(), value.as_str());
                }
            }
            if let Some(body) = request_body {
                request = request.body(body);
            }

            match request.send() {
                Ok(resp) if resp.status().is_server_error() && attempt < attempts => {
                    warn!(status = %resp.status(), %url, attempt, "server error; retrying");
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < attempts => {
                    warn!(error = %e, %url, attempt, "request failed; retrying");
                }
                Err(e) => return Err(BackendError::Transport(e.to_string())),
            }
            std::thread::sleep(Duration::from_millis(100 << attempt.min(6)));
        }
    }

    fn signed_headers(
        &self,
        method: &Method,
        url: &Url,
        canonical_uri: &str,
        canonical_query: &str,
        extra: &[(&str, String)],
        payload_hash: &str,
    ) -> BTreeMap<String, String> {
        let now = Utc::now();
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        if let Some(token) = &self.config.credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        for (name, value) in extra {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        let signer = Signer {
            access_key_id: &self.config.credentials.access_key_id,
            secret_access_key: &self.config.credentials.secret_access_key,
            region: &self.config.region,
            service: "s3",
        };
        let authorization = signer.authorization(
            &SigningRequest {
                method: method.as_str(),
                canonical_uri,
                canonical_query,
                headers: &headers,
                payload_hash,
            },
            now,
        );
        headers.insert("authorization".to_string(), authorization);
        headers
    }

    fn xml_request(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, String)],
        xml: String,
    ) -> BackendResult<Response> {
        let checksum = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(xml.as_bytes()));
        self.send(
            method,
            bucket,
            key,
            query,
            &[
                ("content-type", "application/xml".to_string()),
                ("x-amz-checksum-sha256", checksum),
            ],
            Payload::Xml(xml),
        )
    }
}

fn payload_hash_for(payload: &Payload, has_body: bool) -> String {
    match payload {
        Payload::Xml(xml) => sigv4::sha256_hex(xml.as_bytes()),
        _ if has_body => UNSIGNED_PAYLOAD.to_string(),
        _ => EMPTY_PAYLOAD_SHA256.to_string(),
    }
}

fn version_query(version_id: Option<&str>) -> Vec<(&'static str, String)> {
    version_id
        .map(|v| vec![("versionId", v.to_string())])
        .unwrap_or_default()
}

/// Fail unless the response is a success; the error carries the service's
/// error code and message.
fn expect_success(resp: Response) -> BackendResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(service_error(status, &body))
}

fn service_error(status: StatusCode, body: &str) -> BackendError {
    let code = xml_values(body, "Code").into_iter().next();
    let message = xml_values(body, "Message").into_iter().next();
    let message = match (code, message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code,
        _ => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    BackendError::Remote {
        status: status.as_u16(),
        message,
    }
}

/// Object metadata from `HEAD` response headers.
fn object_head(headers: &HeaderMap) -> ObjectHead {
    ObjectHead {
        version_id: header(headers, "x-amz-version-id").map(str::to_string),
        size: header(headers, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        storage_class: header(headers, "x-amz-storage-class")
            .map(StorageClass::from_service)
            .unwrap_or_default(),
        restore: RestoreStatus::from_header(header(headers, "x-amz-restore")),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Text content of every `<tag>` element.
fn xml_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn tagging_xml(tags: &[(String, String)]) -> String {
    let tags: String = tags
        .iter()
        .map(|(k, v)| format!("<Tag><Key>{}</Key><Value>{}</Value></Tag>", xml_escape(k), xml_escape(v)))
        .collect();
    format!("<Tagging xmlns=\"{S3_NS}\"><TagSet>{tags}</TagSet></Tagging>")
}

/// Key and value of each `<Tag>`. Tags missing either are skipped.
fn parse_tagging(body: &str) -> Tags {
    xml_values(body, "Tag")
        .iter()
        .filter_map(|tag| {
            let key = xml_values(tag, "Key").into_iter().next()?;
            let value = xml_values(tag, "Value").into_iter().next()?;
            Some((key, value))
        })
        .collect()
}

/// Whether a `GetBucketVersioning` response reports versioning as enabled.
fn versioning_enabled(body: &str) -> bool {
    xml_values(body, "Status").iter().any(|s| s == "Enabled")
}

impl ObjectStorageClient for HttpObjectStorage {
    fn bucket_exists(&self, bucket: &str) -> BackendResult<bool> {
        let resp = self.send(Method::HEAD, bucket, None, &[], &[], Payload::Empty)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => expect_success(resp).map(|_| true),
        }
    }

    fn create_bucket(&self, bucket: &str) -> BackendResult<()> {
        let resp = if self.config.region == "us-east-1" {
            self.send(Method::PUT, bucket, None, &[], &[], Payload::Empty)?
        } else {
            let xml = format!(
                "<CreateBucketConfiguration xmlns=\"{S3_NS}\"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                xml_escape(&self.config.region)
            );
            self.xml_request(Method::PUT, bucket, None, &[], xml)?
        };
        expect_success(resp)?;
        debug!(bucket, "bucket created");
        Ok(())
    }

    fn enable_versioning(&self, bucket: &str) -> BackendResult<()> {
        let xml = format!(
            "<VersioningConfiguration xmlns=\"{S3_NS}\"><Status>Enabled</Status></VersioningConfiguration>"
        );
        let resp = self.xml_request(Method::PUT, bucket, None, &[("versioning", String::new())], xml)?;
        expect_success(resp).map(|_| ())
    }

    fn bucket_versioning(&self, bucket: &str) -> BackendResult<bool> {
        let resp = self.send(
            Method::GET,
            bucket,
            None,
            &[("versioning", String::new())],
            &[],
            Payload::Empty,
        )?;
        let body = expect_success(resp)?
            .text()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(versioning_enabled(&body))
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        content_type: Option<&str>,
    ) -> BackendResult<Option<String>> {
        let headers: Vec<(&str, String)> = content_type
            .map(|ct| vec![("content-type", ct.to_string())])
            .unwrap_or_default();
        let resp = self.send(Method::PUT, bucket, Some(key), &[], &headers, Payload::Stream(body))?;
        let resp = expect_success(resp)?;
        Ok(header(resp.headers(), "x-amz-version-id").map(str::to_string))
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>> {
        let resp = self.send(
            Method::GET,
            bucket,
            Some(key),
            &version_query(version_id),
            &[],
            Payload::Empty,
        )?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Box::new(expect_success(resp)?)))
    }

    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<ObjectHead>> {
        let resp = self.send(
            Method::HEAD,
            bucket,
            Some(key),
            &version_query(version_id),
            &[],
            Payload::Empty,
        )?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = expect_success(resp)?;
        Ok(Some(object_head(resp.headers())))
    }

    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<()> {
        let resp = self.send(
            Method::DELETE,
            bucket,
            Some(key),
            &version_query(version_id),
            &[],
            Payload::Empty,
        )?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            _ => expect_success(resp).map(|_| ()),
        }
    }

    fn get_object_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Tags> {
        let mut query = version_query(version_id);
        query.push(("tagging", String::new()));
        let resp = self.send(Method::GET, bucket, Some(key), &query, &[], Payload::Empty)?;
        let body = expect_success(resp)?
            .text()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(parse_tagging(&body))
    }

    fn put_object_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        tags: &[(String, String)],
    ) -> BackendResult<()> {
        let mut query = version_query(version_id);
        query.push(("tagging", String::new()));
        let resp = self.xml_request(Method::PUT, bucket, Some(key), &query, tagging_xml(tags))?;
        expect_success(resp).map(|_| ())
    }

    fn change_storage_class(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        class: &StorageClass,
    ) -> BackendResult<Option<String>> {
        let mut source = format!("/{bucket}/{}", sigv4::uri_encode(key, true));
        if let Some(v) = version_id {
            source.push_str(&format!("?versionId={}", sigv4::uri_encode(v, false)));
        }
        let headers = [
            ("x-amz-copy-source", source),
            ("x-amz-storage-class", class.as_str().to_string()),
            ("x-amz-metadata-directive", "COPY".to_string()),
        ];
        let resp = self.send(Method::PUT, bucket, Some(key), &[], &headers, Payload::Empty)?;
        let resp = expect_success(resp)?;
        let version = header(resp.headers(), "x-amz-version-id").map(str::to_string);
        let body = resp
            .text()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        // A copy can fail after the 200 status line has been sent.
        if body.contains("<Error>") {
            return Err(service_error(StatusCode::OK, &body));
        }
        Ok(version)
    }

    fn restore_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        days: u32,
    ) -> BackendResult<()> {
        let xml = format!("<RestoreRequest xmlns=\"{S3_NS}\"><Days>{days}</Days></RestoreRequest>");
        let mut query = version_query(version_id);
        query.push(("restore", String::new()));
        let resp = self.xml_request(Method::POST, bucket, Some(key), &query, xml)?;
        match resp.status() {
            // RestoreAlreadyInProgress
            StatusCode::CONFLICT => Ok(()),
            _ => expect_success(resp).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn storage(path_style: bool) -> HttpObjectStorage {
        HttpObjectStorage::new(HttpStorageConfig {
            endpoint: Url::parse("https://s3.eu-west-1.amazonaws.com").unwrap(),
            region: "eu-west-1".into(),
            credentials: Credentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            path_style,
            connect_timeout: Duration::from_secs(5),
            max_retries: 2,
        })
        .unwrap()
    }

    #[test]
    fn path_style_urls() {
        let (url, path) = storage(true).locate("archive", Some("org1/mp1/1/el A.mp4")).unwrap();
        assert_eq!(path, "/archive/org1/mp1/1/el%20A.mp4");
        assert_eq!(url.as_str(), "https://s3.eu-west-1.amazonaws.com/archive/org1/mp1/1/el%20A.mp4");

        let (_, path) = storage(true).locate("archive", None).unwrap();
        assert_eq!(path, "/archive");
    }

    #[test]
    fn virtual_host_urls() {
        let (url, path) = storage(false).locate("archive", Some("org1/mp1/1/elA.mp4")).unwrap();
        assert_eq!(path, "/org1/mp1/1/elA.mp4");
        assert_eq!(url.host_str(), Some("archive.s3.eu-west-1.amazonaws.com"));
    }

    #[test]
    fn signed_headers_carry_authorization() {
        let s = storage(true);
        let (url, path) = s.locate("archive", Some("k")).unwrap();
        let headers = s.signed_headers(&Method::GET, &url, &path, "", &[], EMPTY_PAYLOAD_SHA256);
        let auth = &headers["authorization"];
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"));
        assert!(auth.contains("/eu-west-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert_eq!(headers["host"], "s3.eu-west-1.amazonaws.com");
    }

    #[test]
    fn tagging_round_trip() {
        let tags = vec![("Freezable".to_string(), "true".to_string())];
        assert_eq!(parse_tagging(&tagging_xml(&tags)), tags);
        let odd = vec![("a&b".to_string(), "<x>".to_string())];
        assert_eq!(parse_tagging(&tagging_xml(&odd)), odd);
    }

    #[test]
    fn tags_pair_within_each_tag() {
        let body = "<Tagging><TagSet>\
            <Tag><Key>Project</Key></Tag>\
            <Tag><Value>true</Value><Key>Freezable</Key></Tag>\
            <Tag><Key>Owner</Key><Value>ops</Value></Tag>\
            </TagSet></Tagging>";
        assert_eq!(
            parse_tagging(body),
            vec![
                ("Freezable".to_string(), "true".to_string()),
                ("Owner".to_string(), "ops".to_string()),
            ]
        );
        assert!(parse_tagging("<Tagging><TagSet></TagSet></Tagging>").is_empty());
    }

    #[test]
    fn head_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("x-amz-version-id", HeaderValue::from_static("3HL4kqtJlcpXroDTDmJ"));
        headers.insert("x-amz-storage-class", HeaderValue::from_static("EXPRESS_ONEZONE"));
        headers.insert("x-amz-restore", HeaderValue::from_static("ongoing-request=\"true\""));
        let head = object_head(&headers);
        assert_eq!(head.size, 42);
        assert_eq!(head.version_id.as_deref(), Some("3HL4kqtJlcpXroDTDmJ"));
        assert_eq!(head.storage_class, StorageClass::Other("EXPRESS_ONEZONE".into()));
        assert_eq!(head.restore, RestoreStatus::Restoring);

        // Standard objects carry no class header.
        let head = object_head(&HeaderMap::new());
        assert_eq!(head.storage_class, StorageClass::Standard);
        assert_eq!(head.restore, RestoreStatus::None);
        assert_eq!(head.version_id, None);
    }

    #[test]
    fn versioning_status() {
        let enabled = "<VersioningConfiguration><Status>Enabled</Status></VersioningConfiguration>";
        let suspended = "<VersioningConfiguration><Status>Suspended</Status></VersioningConfiguration>";
        assert!(versioning_enabled(enabled));
        assert!(!versioning_enabled(suspended));
        assert!(!versioning_enabled("<VersioningConfiguration/>"));
    }

    #[test]
    fn service_errors() {
        let body = "<Error><Code>NoSuchKey</Code><Message>gone</Message></Error>";
        match service_error(StatusCode::NOT_FOUND, body) {
            BackendError::Remote { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "NoSuchKey: gone");
            }
            other => panic!("unexpected {other:?}"),
        }
        match service_error(StatusCode::SERVICE_UNAVAILABLE, "") {
            BackendError::Remote { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_body_parsing() {
        let body = "<Error><Code>NoSuchBucket</Code><Message>The bucket does not exist</Message></Error>";
        assert_eq!(xml_values(body, "Code"), vec!["NoSuchBucket"]);
        assert_eq!(xml_values(body, "Message"), vec!["The bucket does not exist"]);
        assert!(xml_values(body, "Missing").is_empty());
    }

    #[test]
    fn endpoint_needs_host() {
        let mut config = storage(true).config;
        config.endpoint = Url::parse("file:///tmp").unwrap();
        assert!(HttpObjectStorage::new(config).is_err());
    }
}
