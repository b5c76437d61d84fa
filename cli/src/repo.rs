use std::path::PathBuf;

use anyhow::Context;

use stargate_store::index::SqlUnixFsIndex;

/// The stargate repo directory: one CAR file per imported root under
/// `carstore/`, plus the SQL index at `db`.
pub struct Repo {
    dir: PathBuf,
}

impl Repo {
    pub fn from_flag(raw: &str) -> anyhow::Result<Self> {
        Ok(Self {
            dir: expand_home(raw)?,
        })
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating repo at {}", self.dir.display()))?;
        std::fs::create_dir_all(self.carstore_dir()).context("creating carstore")?;
        Ok(())
    }

    pub fn carstore_dir(&self) -> PathBuf {
        self.dir.join("carstore")
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join("db")
    }

    pub fn open_index(&self) -> anyhow::Result<SqlUnixFsIndex> {
        SqlUnixFsIndex::open(self.db_path()).context("opening index database")
    }
}

fn expand_home(raw: &str) -> anyhow::Result<PathBuf> {
    if raw == "~" {
        return Ok(PathBuf::from(home()?));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return Ok(PathBuf::from(home()?).join(rest));
    }
    Ok(PathBuf::from(raw))
}

fn home() -> anyhow::Result<std::ffi::OsString> {
    std::env::var_os("HOME").context("expanding ~: HOME is not set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_layout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let repo = Repo::from_flag(tmp.path().to_str().unwrap()).unwrap();
        repo.ensure().unwrap();

        assert!(repo.carstore_dir().is_dir());
        assert_eq!(repo.db_path(), tmp.path().join("db"));
        repo.open_index().unwrap();
        assert!(repo.db_path().is_file());
    }

    #[test]
    fn tilde_expansion() {
        let home = std::env::var("HOME").expect("HOME set in test environment");
        assert_eq!(
            expand_home("~/stargate").unwrap(),
            PathBuf::from(&home).join("stargate")
        );
        assert_eq!(expand_home("/abs/path").unwrap(), PathBuf::from("/abs/path"));
    }
}
