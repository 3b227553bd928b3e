use std::{fs::read_to_string, path::Path, path::PathBuf};

use url::Url;

use crate::error::ConfigLoadError;

/// Database-related environment inputs.
#[derive(Debug, Clone, Default)]
pub struct DatabaseEnv {
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
}

impl DatabaseEnv {
    /// Read `DATABASE_URL[_FILE]` and the libpq-style `PG*` variables.
    pub fn gather() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            database_url_file: std::env::var("DATABASE_URL_FILE")
                .ok()
                .map(PathBuf::from),
            host: std::env::var("PGHOST").ok(),
            port: std::env::var("PGPORT").ok().and_then(|s| s.parse().ok()),
            user: std::env::var("PGUSER").ok(),
            name: std::env::var("PGDATABASE").ok(),
            password: std::env::var("PGPASSWORD").ok(),
            password_file: std::env::var("PGPASSWORD_FILE")
                .ok()
                .map(PathBuf::from),
        }
    }
}

/// Resolve the PostgreSQL connection URL: an explicit url wins, then a url
/// file, then a url assembled from host/user/database parts.
pub fn resolve_database_url(
    env: &DatabaseEnv,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(url) = env
        .database_url
        .clone()
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(Some(url));
    }

    if let Some(path) = env.database_url_file.as_ref()
        && let Some(url) = read_secret_file(path)?
    {
        return Ok(Some(url));
    }

    let host = env.host.clone().filter(|value| !value.trim().is_empty());
    let user = env.user.clone().filter(|value| !value.trim().is_empty());
    let name = env.name.clone().filter(|value| !value.trim().is_empty());

    if let (Some(host), Some(user), Some(name)) = (host, user, name) {
        let port = env.port.unwrap_or(5432);
        let mut url = Url::parse(&format!("postgresql://{host}:{port}/{name}"))
            .map_err(|source| ConfigLoadError::InvalidDatabaseUrl {
                source,
            })?;
        url.set_username(&user).map_err(|_| {
            ConfigLoadError::InvalidDatabaseUsername {
                username: user.clone(),
            }
        })?;
        if let Some(password) = resolve_database_password(env)? {
            url.set_password(Some(&password))
                .map_err(|_| ConfigLoadError::InvalidDatabasePassword)?;
        }
        return Ok(Some(url.to_string()));
    }

    Ok(None)
}

fn resolve_database_password(
    env: &DatabaseEnv,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(password) = env
        .password
        .clone()
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(Some(password));
    }

    match env.password_file.as_ref() {
        Some(path) => read_secret_file(path),
        None => Ok(None),
    }
}

pub fn read_secret_file(
    path: &Path,
) -> Result<Option<String>, ConfigLoadError> {
    let contents = read_to_string(path).map_err(|source| {
        ConfigLoadError::SecretFileIo {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_url_wins() {
        let env = DatabaseEnv {
            database_url: Some("postgres://a@b/c".into()),
            host: Some("ignored".into()),
            ..DatabaseEnv::default()
        };
        assert_eq!(
            resolve_database_url(&env).unwrap().as_deref(),
            Some("postgres://a@b/c")
        );
    }

    #[test]
    fn url_file_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "  postgres://crawler@db/crawl  ").expect("write");
        let env = DatabaseEnv {
            database_url_file: Some(file.path().to_path_buf()),
            ..DatabaseEnv::default()
        };
        assert_eq!(
            resolve_database_url(&env).unwrap().as_deref(),
            Some("postgres://crawler@db/crawl")
        );
    }

    #[test]
    fn assembles_url_from_parts() {
        let env = DatabaseEnv {
            host: Some("db".into()),
            user: Some("crawler".into()),
            name: Some("crawl".into()),
            password: Some("s3cret".into()),
            port: Some(6543),
            ..DatabaseEnv::default()
        };
        assert_eq!(
            resolve_database_url(&env).unwrap().as_deref(),
            Some("postgresql://crawler:s3cret@db:6543/crawl")
        );
    }

    #[test]
    fn incomplete_parts_resolve_to_none() {
        let env = DatabaseEnv {
            host: Some("db".into()),
            ..DatabaseEnv::default()
        };
        assert_eq!(resolve_database_url(&env).unwrap(), None);
    }
}
