//! Layer split.
//!
//! Packages are grouped by origin in installation order. Each of the first
//! `budget - 1` groups becomes a layer of its own; everything else, including
//! files the resolver wrote itself, goes into one final layer. Each layer also
//! carries the parent directories of its entries, so it unpacks on its own.

use std::collections::{HashMap, HashSet};

use stratum_core::{Layering, LayeringStrategy};

use crate::archive::{EntryKind, FileEntry};
use crate::resolve::InstalledPackage;

const REMAINDER: &str = "remaining files";

/// The entries of one layer, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerContents {
    comment: String,
    entries: Vec<FileEntry>,
}

impl LayerContents {
    /// What the layer holds, recorded in the image history.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }
}

/// Split a sorted tree into ordered layers.
///
/// Without `layering`, or with a budget of one, the whole tree is a single
/// layer. The result is never empty.
pub fn split(
    entries: &[FileEntry],
    packages: &[InstalledPackage],
    layering: Option<&Layering>,
) -> Vec<LayerContents> {
    let groups = match layering {
        Some(layering) => groups(packages, layering),
        None => Vec::new(),
    };
    let remainder = groups.len();

    let directories: HashSet<&str> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Directory)
        .map(|e| e.path.as_str())
        .collect();

    // A directory belongs to the first group that installed it; anything
    // else to the last one, since later packages overwrite earlier files.
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, group) in groups.iter().enumerate() {
        for package in &group.packages {
            for file in &package.files {
                if directories.contains(file.as_str()) {
                    owner.entry(file.as_str()).or_insert(i);
                } else {
                    owner.insert(file.as_str(), i);
                }
            }
        }
    }

    let mut members: Vec<HashSet<&str>> = vec![HashSet::new(); remainder + 1];
    for entry in entries {
        let path = entry.path.as_str();
        let layer = owner.get(path).copied().unwrap_or(remainder);
        members[layer].insert(path);
        for parent in parents(path) {
            if directories.contains(parent) {
                members[layer].insert(parent);
            }
        }
    }

    let comments = groups
        .iter()
        .map(|g| format!("packages from origin {}", g.origin))
        .chain(std::iter::once(REMAINDER.to_string()));

    let mut layers: Vec<LayerContents> = comments
        .zip(&members)
        .map(|(comment, member)| LayerContents {
            comment,
            entries: entries
                .iter()
                .filter(|e| member.contains(e.path.as_str()))
                .cloned()
                .collect(),
        })
        .filter(|layer| !layer.entries.is_empty())
        .collect();

    if layers.is_empty() {
        layers.push(LayerContents {
            comment: REMAINDER.to_string(),
            entries: Vec::new(),
        });
    }
    layers
}

struct OriginGroup<'a> {
    origin: &'a str,
    packages: Vec<&'a InstalledPackage>,
}

/// Groups that get their own layer, in installation order.
fn groups<'a>(packages: &'a [InstalledPackage], layering: &Layering) -> Vec<OriginGroup<'a>> {
    match layering.strategy {
        LayeringStrategy::Origin => by_origin(packages, layering.budget),
    }
}

fn by_origin(packages: &[InstalledPackage], budget: usize) -> Vec<OriginGroup<'_>> {
    let mut groups: Vec<OriginGroup<'_>> = Vec::new();
    for package in packages {
        match groups.iter_mut().find(|g| g.origin == package.origin) {
            Some(group) => group.packages.push(package),
            None => groups.push(OriginGroup {
                origin: &package.origin,
                packages: vec![package],
            }),
        }
    }
    groups.truncate(budget.saturating_sub(1));
    groups
}

/// Proper ancestors of a `/`-separated path, nearest first.
fn parents(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .rev()
        .filter(|&(_, c)| c == '/')
        .map(move |(i, _)| &path[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::Architecture;

    fn tree() -> Vec<FileEntry> {
        let mut entries = vec![
            FileEntry::directory("etc", 0o755).unwrap(),
            FileEntry::directory("etc/apk", 0o755).unwrap(),
            FileEntry::file("etc/apk/world", "busybox\nlibcrypto3\nlibssl3\n", 0o644).unwrap(),
            FileEntry::directory("usr", 0o755).unwrap(),
            FileEntry::directory("usr/bin", 0o755).unwrap(),
            FileEntry::file("usr/bin/busybox", "busybox", 0o755).unwrap(),
            FileEntry::directory("usr/lib", 0o755).unwrap(),
            FileEntry::file("usr/lib/libcrypto.so.3", "crypto", 0o755).unwrap(),
            FileEntry::file("usr/lib/libssl.so.3", "ssl", 0o755).unwrap(),
        ];
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    fn package(name: &str, origin: &str, files: &[&str]) -> InstalledPackage {
        InstalledPackage {
            name: name.to_string(),
            version: None,
            repository: "/repo".to_string(),
            architecture: Architecture::Amd64,
            origin: origin.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn packages() -> Vec<InstalledPackage> {
        vec![
            package("busybox", "busybox", &["usr", "usr/bin", "usr/bin/busybox"]),
            package("libcrypto3", "openssl", &["usr", "usr/lib", "usr/lib/libcrypto.so.3"]),
            package("libssl3", "openssl", &["usr", "usr/lib", "usr/lib/libssl.so.3"]),
        ]
    }

    fn paths(layer: &LayerContents) -> Vec<&str> {
        layer.entries().iter().map(|e| e.path.as_str()).collect()
    }

    fn budget(budget: usize) -> Layering {
        Layering {
            strategy: LayeringStrategy::Origin,
            budget,
        }
    }

    #[test]
    fn test_no_layering_is_one_layer() {
        let layers = split(&tree(), &packages(), None);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].entries(), tree().as_slice());
        assert_eq!(split(&tree(), &packages(), Some(&budget(1))), layers);
    }

    #[test]
    fn test_origins_share_a_layer() {
        let layers = split(&tree(), &packages(), Some(&budget(3)));
        assert_eq!(layers.len(), 3);
        assert_eq!(paths(&layers[0]), vec!["usr", "usr/bin", "usr/bin/busybox"]);
        assert_eq!(
            paths(&layers[1]),
            vec!["usr", "usr/lib", "usr/lib/libcrypto.so.3", "usr/lib/libssl.so.3"]
        );
        assert_eq!(paths(&layers[2]), vec!["etc", "etc/apk", "etc/apk/world"]);
        assert_eq!(layers[1].comment(), "packages from origin openssl");
        assert_eq!(layers[2].comment(), REMAINDER);
    }

    #[test]
    fn test_budget_folds_rest_into_final_layer() {
        let layers = split(&tree(), &packages(), Some(&budget(2)));
        assert_eq!(layers.len(), 2);
        assert_eq!(paths(&layers[0]), vec!["usr", "usr/bin", "usr/bin/busybox"]);
        assert_eq!(
            paths(&layers[1]),
            vec![
                "etc",
                "etc/apk",
                "etc/apk/world",
                "usr",
                "usr/lib",
                "usr/lib/libcrypto.so.3",
                "usr/lib/libssl.so.3"
            ]
        );
    }

    #[test]
    fn test_every_entry_lands_in_some_layer() {
        let tree = tree();
        let layers = split(&tree, &packages(), Some(&budget(8)));
        let mut seen: Vec<&str> = layers.iter().flat_map(paths).collect();
        seen.sort_unstable();
        seen.dedup();
        let all: Vec<&str> = tree.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn test_empty_tree_yields_one_empty_layer() {
        let layers = split(&[], &[], Some(&budget(4)));
        assert_eq!(layers.len(), 1);
        assert!(layers[0].entries().is_empty());
    }

    #[test]
    fn test_parents() {
        let found: Vec<_> = parents("usr/lib/libssl.so.3").collect();
        assert_eq!(found, vec!["usr/lib", "usr"]);
        assert_eq!(parents("etc").count(), 0);
    }
}
