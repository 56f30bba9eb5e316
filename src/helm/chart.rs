use crate::crd::{ChartSpec, DEVEL_VERSION};
use crate::error::{Error, Result};
use crate::helm::ChartMetadata;
use flate2::read::GzDecoder;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Helm chart media types in OCI registries.
const OCI_HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
const OCI_HELM_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// Credentials for a chart repository or registry. Empty credentials mean
/// anonymous access.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoCreds {
    pub username: String,
    pub password: String,
}

impl RepoCreds {
    pub fn anonymous() -> Self {
        RepoCreds::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// A chart pulled into the local cache, ready to hand to a deploy action.
#[derive(Debug, Clone)]
pub struct Chart {
    pub path: PathBuf,
    pub metadata: ChartMetadata,
}

#[derive(Deserialize, Debug)]
struct RepoIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<IndexEntry>>,
}

#[derive(Deserialize, Debug, Clone)]
struct IndexEntry {
    #[serde(default)]
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

/// Resolves chart specs to cached chart archives. The cache directory is
/// shared process wide and entries are addressed purely by file name.
pub struct ChartResolver {
    cache_dir: PathBuf,
    http: reqwest::Client,
    accept_invalid_certs: bool,
}

impl ChartResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, accept_invalid_certs: bool) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| Error::HelmClientBuild(e.to_string()))?;
        Ok(Self {
            cache_dir,
            http,
            accept_invalid_certs,
        })
    }

    /// Pulls the chart identified by the spec, unless it is already cached,
    /// and loads its metadata.
    ///
    /// A release pinned to no version or the devel constraint always pulls
    /// the latest artifact through a temporary directory and renames it into
    /// the cache; every other spec resolves to a stable cache file first.
    pub async fn pull_and_load(&self, spec: &ChartSpec, creds: &RepoCreds) -> Result<Chart> {
        let chart_file = if is_devel(spec) {
            self.pull_latest(spec, creds).await?
        } else {
            let path = self.cache_dir.join(cache_file_name(spec)?);
            if !path.exists() {
                self.pull_pinned(spec, creds, &path).await?;
            }
            path
        };
        load_chart(&chart_file)
    }

    async fn pull_latest(&self, spec: &ChartSpec, creds: &RepoCreds) -> Result<PathBuf> {
        let tmp = tempfile::tempdir_in(&self.cache_dir)?;

        if let Some(reference) = oci_reference(spec)? {
            let tag = reference.tag().unwrap_or("latest").to_owned();
            let name = chart_name_of(&reference);
            let dest = tmp.path().join(format!("{name}-{tag}.tgz"));
            self.pull_oci(&reference, &tag, creds, &dest).await?;
        } else if let Some(url) = spec.url.as_deref().filter(|u| !u.is_empty()) {
            let dest = tmp.path().join(url_basename(url)?);
            self.download(url, creds, &dest).await?;
        } else {
            let (repository, name) = repo_and_name(spec)?;
            let index = self.fetch_index(repository, creds).await?;
            let entry = resolve_entry(&index, name, None)?;
            let download_url = resolve_download_url(repository, &entry)?;
            let dest = tmp.path().join(url_basename(download_url.as_str())?);
            self.download(download_url.as_str(), creds, &dest).await?;
        }

        let file_name = single_file_name(tmp.path())?;
        let target = self.cache_dir.join(&file_name);
        std::fs::rename(tmp.path().join(&file_name), &target)?;
        Ok(target)
    }

    async fn pull_pinned(&self, spec: &ChartSpec, creds: &RepoCreds, dest: &Path) -> Result<()> {
        if let Some(reference) = oci_reference(spec)? {
            let tag = oci_tag(spec, &reference);
            return self.pull_oci(&reference, &tag, creds, dest).await;
        }
        if let Some(url) = spec.url.as_deref().filter(|u| !u.is_empty()) {
            return self.download(url, creds, dest).await;
        }
        let (repository, name) = repo_and_name(spec)?;
        let version = spec.version.as_deref().unwrap_or_default();
        let index = self.fetch_index(repository, creds).await?;
        let entry = resolve_entry(&index, name, Some(version))?;
        let download_url = resolve_download_url(repository, &entry)?;
        self.download(download_url.as_str(), creds, dest).await
    }

    async fn fetch_index(&self, repository: &str, creds: &RepoCreds) -> Result<RepoIndex> {
        let index_url = if repository.ends_with('/') {
            format!("{repository}index.yaml")
        } else {
            format!("{repository}/index.yaml")
        };
        let mut request = self.http.get(&index_url);
        if !creds.is_anonymous() {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::ChartPull(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::ChartPull(format!(
                "HTTP {} fetching {index_url}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::ChartPull(e.to_string()))?;
        serde_yaml::from_str(&body).map_err(|e| Error::ChartPull(e.to_string()))
    }

    async fn download(&self, url: &str, creds: &RepoCreds, dest: &Path) -> Result<()> {
        let mut request = self.http.get(url);
        if !creds.is_anonymous() {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::ChartPull(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::ChartPull(format!(
                "HTTP {} fetching {url}",
                response.status()
            )));
        }
        let data = response
            .bytes()
            .await
            .map_err(|e| Error::ChartPull(e.to_string()))?;
        std::fs::write(dest, &data)?;
        Ok(())
    }

    async fn pull_oci(
        &self,
        reference: &Reference,
        tag: &str,
        creds: &RepoCreds,
        dest: &Path,
    ) -> Result<()> {
        let auth = if creds.is_anonymous() {
            RegistryAuth::Anonymous
        } else {
            RegistryAuth::Basic(creds.username.clone(), creds.password.clone())
        };
        let config = oci_distribution::client::ClientConfig {
            protocol: oci_distribution::client::ClientProtocol::Https,
            accept_invalid_certificates: self.accept_invalid_certs,
            ..Default::default()
        };
        let mut client = oci_distribution::Client::new(config);
        let pinned = Reference::with_tag(
            reference.registry().to_owned(),
            reference.repository().to_owned(),
            tag.to_owned(),
        );

        let image = client
            .pull(&pinned, &auth, vec![OCI_HELM_CONFIG, OCI_HELM_CONTENT])
            .await
            .map_err(|e| Error::ChartPull(e.to_string()))?;
        let layer = image
            .layers
            .iter()
            .find(|l| l.media_type == OCI_HELM_CONTENT)
            .ok_or_else(|| Error::ChartPull("no chart content layer in manifest".to_owned()))?;
        std::fs::write(dest, &layer.data)?;
        Ok(())
    }
}

/// True when the spec pins no concrete version and the latest artifact must
/// be pulled.
fn is_devel(spec: &ChartSpec) -> bool {
    match spec.version.as_deref() {
        None | Some("") => true,
        Some(v) => v == DEVEL_VERSION,
    }
}

fn repo_and_name(spec: &ChartSpec) -> Result<(&str, &str)> {
    match (spec.repository.as_deref(), spec.name.as_deref()) {
        (Some(repository), Some(name)) if !repository.is_empty() && !name.is_empty() => {
            Ok((repository, name))
        }
        _ => Err(Error::ChartSpecIncomplete),
    }
}

fn oci_reference(spec: &ChartSpec) -> Result<Option<Reference>> {
    let raw = if let Some(url) = spec.url.as_deref().filter(|u| u.starts_with("oci://")) {
        url.to_owned()
    } else if let Some(repository) = spec
        .repository
        .as_deref()
        .filter(|r| r.starts_with("oci://"))
    {
        match spec.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{}/{name}", repository.trim_end_matches('/')),
            None => repository.to_owned(),
        }
    } else {
        return Ok(None);
    };

    let clean = raw.trim_start_matches("oci://");
    Reference::try_from(clean)
        .map(Some)
        .map_err(|e| Error::OciReference(format!("{raw}: {e}")))
}

fn oci_tag(spec: &ChartSpec, reference: &Reference) -> String {
    if let Some(tag) = reference.tag() {
        return tag.to_owned();
    }
    match spec.version.as_deref() {
        Some(version) if !version.is_empty() => version.to_owned(),
        _ => "latest".to_owned(),
    }
}

fn chart_name_of(reference: &Reference) -> String {
    reference
        .repository()
        .rsplit('/')
        .next()
        .unwrap_or("chart")
        .to_owned()
}

fn url_basename(raw: &str) -> Result<String> {
    let url = Url::parse(raw)?;
    let basename = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ChartPull(format!("no file name in URL {raw}")))?;
    Ok(basename.to_owned())
}

/// Stable cache file for a version-pinned spec.
fn cache_file_name(spec: &ChartSpec) -> Result<String> {
    if let Some(reference) = oci_reference(spec)? {
        let tag = oci_tag(spec, &reference);
        return Ok(format!("{}-{tag}.tgz", chart_name_of(&reference)));
    }
    if let Some(url) = spec.url.as_deref().filter(|u| !u.is_empty()) {
        return url_basename(url);
    }
    let (_, name) = repo_and_name(spec)?;
    let version = spec.version.as_deref().unwrap_or_default();
    Ok(format!("{name}-{version}.tgz"))
}

fn resolve_entry(index: &RepoIndex, name: &str, version: Option<&str>) -> Result<IndexEntry> {
    let entries = index
        .entries
        .get(name)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| {
            Error::ChartVersionNotFound(name.to_owned(), version.unwrap_or("*").to_owned())
        })?;

    let found = match version {
        Some(version) => entries.iter().find(|e| e.version == version),
        None => entries.iter().max_by(|a, b| compare_versions(&a.version, &b.version)),
    };
    found.cloned().ok_or_else(|| {
        Error::ChartVersionNotFound(name.to_owned(), version.unwrap_or("*").to_owned())
    })
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (
        semver::Version::parse(a.trim_start_matches('v')),
        semver::Version::parse(b.trim_start_matches('v')),
    ) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

fn resolve_download_url(repository: &str, entry: &IndexEntry) -> Result<Url> {
    let raw = entry
        .urls
        .first()
        .ok_or_else(|| Error::ChartPull("index entry has no download URL".to_owned()))?;
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(Url::parse(raw)?);
    }
    let base = if repository.ends_with('/') {
        Url::parse(repository)?
    } else {
        Url::parse(&format!("{repository}/"))?
    };
    Ok(base.join(raw)?)
}

fn single_file_name(dir: &Path) -> Result<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    if names.len() != 1 {
        return Err(Error::UnexpectedDirContent(names.join(",")));
    }
    Ok(names.remove(0))
}

/// Opens a chart archive and parses its Chart.yaml into metadata.
pub fn load_chart(path: &Path) -> Result<Chart> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::ChartLoad(format!("{}: {e}", path.display())))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive
        .entries()
        .map_err(|e| Error::ChartLoad(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| Error::ChartLoad(e.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::ChartLoad(e.to_string()))?
            .into_owned();
        let mut components = entry_path.components();
        let is_chart_yaml = components.next().is_some()
            && components.as_path() == Path::new("Chart.yaml");
        if !is_chart_yaml {
            continue;
        }
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut entry, &mut contents)
            .map_err(|e| Error::ChartLoad(e.to_string()))?;
        let metadata: ChartMetadata =
            serde_yaml::from_str(&contents).map_err(|e| Error::ChartLoad(e.to_string()))?;
        return Ok(Chart {
            path: path.to_path_buf(),
            metadata,
        });
    }

    Err(Error::ChartLoad(format!(
        "no Chart.yaml in {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn spec(repository: Option<&str>, name: Option<&str>, version: Option<&str>, url: Option<&str>) -> ChartSpec {
        ChartSpec {
            repository: repository.map(str::to_owned),
            name: name.map(str::to_owned),
            version: version.map(str::to_owned),
            url: url.map(str::to_owned),
            pull_secret_ref: None,
        }
    }

    #[test]
    fn test_is_devel() {
        assert!(is_devel(&spec(Some("r"), Some("n"), None, None)));
        assert!(is_devel(&spec(Some("r"), Some("n"), Some(""), None)));
        assert!(is_devel(&spec(Some("r"), Some("n"), Some(">0.0.0-0"), None)));
        assert!(!is_devel(&spec(Some("r"), Some("n"), Some("1.2.3"), None)));
    }

    #[test]
    fn test_cache_file_name_repo_chart() {
        let s = spec(
            Some("https://charts.bitnami.com/bitnami"),
            Some("wordpress"),
            Some("15.2.5"),
            None,
        );
        assert_eq!(cache_file_name(&s).unwrap(), "wordpress-15.2.5.tgz");
    }

    #[test]
    fn test_cache_file_name_url_basename() {
        let s = spec(
            None,
            None,
            Some("1.0.0"),
            Some("https://example.com/charts/nginx-1.0.0.tgz"),
        );
        assert_eq!(cache_file_name(&s).unwrap(), "nginx-1.0.0.tgz");
    }

    #[test]
    fn test_cache_file_name_oci_with_tag_in_url() {
        let s = spec(None, None, None, Some("oci://registry.example.com/charts/redis:17.1.0"));
        assert_eq!(cache_file_name(&s).unwrap(), "redis-17.1.0.tgz");
    }

    #[test]
    fn test_cache_file_name_oci_version_fallback() {
        let s = spec(
            Some("oci://registry.example.com/charts"),
            Some("redis"),
            Some("17.1.0"),
            None,
        );
        assert_eq!(cache_file_name(&s).unwrap(), "redis-17.1.0.tgz");
    }

    #[test]
    fn test_cache_file_name_oci_latest_fallback() {
        // no tag in the reference and no version on the spec lands on latest
        let s = spec(None, None, None, Some("oci://registry.example.com/charts/redis"));
        assert_eq!(cache_file_name(&s).unwrap(), "redis-latest.tgz");
    }

    #[test]
    fn test_cache_file_name_incomplete_spec() {
        let s = spec(None, Some("redis"), Some("1.0.0"), None);
        assert!(matches!(cache_file_name(&s), Err(Error::ChartSpecIncomplete)));
    }

    #[test]
    fn test_resolve_entry_exact_and_latest() {
        let index: RepoIndex = serde_yaml::from_str(
            r#"
entries:
  wordpress:
    - version: 15.2.5
      urls: ["wordpress-15.2.5.tgz"]
    - version: 15.10.0
      urls: ["wordpress-15.10.0.tgz"]
    - version: 15.9.1
      urls: ["wordpress-15.9.1.tgz"]
"#,
        )
        .unwrap();

        let exact = resolve_entry(&index, "wordpress", Some("15.2.5")).unwrap();
        assert_eq!(exact.version, "15.2.5");

        // semver ordering, not lexicographic: 15.10.0 > 15.9.1
        let latest = resolve_entry(&index, "wordpress", None).unwrap();
        assert_eq!(latest.version, "15.10.0");

        assert!(matches!(
            resolve_entry(&index, "wordpress", Some("9.9.9")),
            Err(Error::ChartVersionNotFound(_, _))
        ));
        assert!(matches!(
            resolve_entry(&index, "nginx", None),
            Err(Error::ChartVersionNotFound(_, _))
        ));
    }

    #[test]
    fn test_resolve_download_url() {
        let entry = IndexEntry {
            version: "1.0.0".to_owned(),
            urls: vec!["charts/nginx-1.0.0.tgz".to_owned()],
        };
        let url = resolve_download_url("https://example.com/stable", &entry).unwrap();
        assert_eq!(url.as_str(), "https://example.com/stable/charts/nginx-1.0.0.tgz");

        let absolute = IndexEntry {
            version: "1.0.0".to_owned(),
            urls: vec!["https://cdn.example.com/nginx-1.0.0.tgz".to_owned()],
        };
        let url = resolve_download_url("https://example.com/stable", &absolute).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/nginx-1.0.0.tgz");
    }

    #[test]
    fn test_single_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.tgz"), b"x").unwrap();
        assert_eq!(single_file_name(dir.path()).unwrap(), "one.tgz");

        std::fs::write(dir.path().join("two.tgz"), b"x").unwrap();
        assert!(matches!(
            single_file_name(dir.path()),
            Err(Error::UnexpectedDirContent(_))
        ));
    }

    fn write_chart_archive(path: &Path, chart_yaml: &str) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(chart_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "wordpress/Chart.yaml", chart_yaml.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_load_chart_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wordpress-15.2.5.tgz");
        write_chart_archive(
            &path,
            "apiVersion: v2\nname: wordpress\nversion: 15.2.5\nappVersion: 6.1.0\n",
        );
        let chart = load_chart(&path).unwrap();
        assert_eq!(chart.metadata.name, "wordpress");
        assert_eq!(chart.metadata.version, "15.2.5");
        assert_eq!(chart.path, path);
    }

    #[test]
    fn test_load_chart_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tgz");
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "broken/values.yaml", "{}".as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(load_chart(&path), Err(Error::ChartLoad(_))));
    }
}
