//! Persistence of produced products between build runs.
//!
//! Each cached product is stored as plain text under the tool-version
//! directory: the property bag as JSON in `<product>.product`, the
//! checksum (or the `EMPTY` sentinel when the task produced nothing) in
//! `<product>.product.checksum`, and the optional output-file descriptor
//! as two newline-delimited records in `<product>.product.info`.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

use camino::Utf8PathBuf;

use crate::error::CacheError;
use crate::product::{OutputInfo, Product, ProductOutcome};

/// Checksum-file sentinel marking a product that was legitimately empty.
pub(crate) const EMPTY_SENTINEL: &str = "EMPTY";

/// On-disk store of cached products, keyed by module and product id.
pub(crate) struct ProductCache {
    root: Utf8PathBuf,
}

struct EntryPaths {
    product: Utf8PathBuf,
    checksum: Utf8PathBuf,
    info: Utf8PathBuf,
}

impl ProductCache {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn paths(&self, module: &str, product: &str) -> EntryPaths {
        let base = self.root.join(module).join(format!("{product}.product"));
        EntryPaths {
            checksum: base.with_extension("product.checksum"),
            info: base.with_extension("product.info"),
            product: base,
        }
    }

    /// Persists the outcome of one completed product, replacing any
    /// previous entry.
    pub(crate) fn store(
        &self,
        module: &str,
        product_id: &str,
        outcome: &ProductOutcome,
    ) -> Result<(), CacheError> {
        let paths = self.paths(module, product_id);
        if let Some(dir) = paths.product.parent() {
            fs::create_dir_all(dir)?;
        }

        match outcome {
            ProductOutcome::Empty => {
                remove_if_exists(&paths.product)?;
                remove_if_exists(&paths.info)?;
                fs::write(&paths.checksum, EMPTY_SENTINEL)?;
            }
            ProductOutcome::Product(product) => {
                let json = serde_json::to_string_pretty(product.properties())?;
                fs::write(&paths.product, json)?;

                // An absent checksum round-trips as an empty file,
                // distinct from the EMPTY sentinel.
                fs::write(&paths.checksum, product.checksum().unwrap_or_default())?;

                match product.output() {
                    Some(output) => {
                        fs::write(&paths.info, format!("{}\n{}\n", output.name, output.path))?;
                    }
                    None => remove_if_exists(&paths.info)?,
                }
            }
        }

        Ok(())
    }

    /// Reconstructs a previously stored product, or `None` if the stored
    /// checksum was the empty sentinel.
    pub(crate) fn load(
        &self,
        module: &str,
        product_id: &str,
    ) -> Result<Option<Product>, CacheError> {
        let paths = self.paths(module, product_id);

        let checksum = match fs::read_to_string(&paths.checksum) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::Malformed {
                    path: paths.checksum,
                    detail: "missing checksum file".to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        if checksum == EMPTY_SENTINEL {
            return Ok(None);
        }

        let json = fs::read_to_string(&paths.product).map_err(|err| match err.kind() {
            ErrorKind::NotFound => CacheError::Malformed {
                path: paths.product.clone(),
                detail: "missing product file".to_string(),
            },
            _ => err.into(),
        })?;
        let properties: BTreeMap<String, Vec<String>> = serde_json::from_str(&json)?;

        let output = match fs::read_to_string(&paths.info) {
            Ok(text) => {
                let mut lines = text.lines();
                match (lines.next(), lines.next()) {
                    (Some(name), Some(path)) => Some(OutputInfo {
                        name: name.to_string(),
                        path: Utf8PathBuf::from(path),
                    }),
                    _ => {
                        return Err(CacheError::Malformed {
                            path: paths.info,
                            detail: "expected name and path records".to_string(),
                        });
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let checksum = (!checksum.is_empty()).then_some(checksum);
        Ok(Some(Product::from_parts(properties, checksum, output)))
    }
}

fn remove_if_exists(path: &Utf8PathBuf) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, ProductCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProductCache::new(dir.path().to_str().unwrap());
        (dir, cache)
    }

    #[test]
    fn test_product_roundtrip() {
        let (_dir, cache) = store();

        let product = Product::new()
            .with_property("classes", ["App.class", "Main.class"])
            .with_property("warnings", ["2"])
            .with_checksum("cafebabe")
            .with_output("jar", "build/app.jar");

        cache
            .store(
                "app",
                "jar",
                &ProductOutcome::Product(Arc::new(product.clone())),
            )
            .unwrap();

        let loaded = cache.load("app", "jar").unwrap().unwrap();
        assert_eq!(loaded, product);
    }

    #[test]
    fn test_empty_roundtrips_to_none() {
        let (_dir, cache) = store();

        cache.store("app", "checkstyle", &ProductOutcome::Empty).unwrap();
        assert!(cache.load("app", "checkstyle").unwrap().is_none());
    }

    #[test]
    fn test_product_without_checksum() {
        let (_dir, cache) = store();
        let product = Product::new().with_property("paths", ["a", "b"]);

        cache
            .store(
                "app",
                "sources",
                &ProductOutcome::Product(Arc::new(product.clone())),
            )
            .unwrap();

        let loaded = cache.load("app", "sources").unwrap().unwrap();
        assert_eq!(loaded.checksum(), None);
        assert_eq!(loaded, product);
    }

    #[test]
    fn test_store_replaces_previous_entry() {
        let (_dir, cache) = store();

        let first = Product::new()
            .with_checksum("v1")
            .with_output("jar", "build/app.jar");
        cache
            .store("app", "jar", &ProductOutcome::Product(Arc::new(first)))
            .unwrap();

        cache.store("app", "jar", &ProductOutcome::Empty).unwrap();
        assert!(cache.load("app", "jar").unwrap().is_none());
    }

    #[test]
    fn test_missing_entry_is_malformed() {
        let (_dir, cache) = store();
        let err = cache.load("app", "jar").unwrap_err();
        assert!(matches!(err, CacheError::Malformed { .. }));
    }
}
