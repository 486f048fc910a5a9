//! # Module Path Resolution
//!
//! Addresses nested submodules by dotted path strings.
//!
//! ## Path Rules:
//! - Segments are separated by `.`
//! - A segment made only of ASCII digits is an **index** (`layers.3`)
//! - Any other segment is an **attribute name** (`attention.q_proj`)
//! - Empty paths and empty segments are rejected
//!
//! ## Example:
//! ```rust,ignore
//! let q_proj = get_module(model.mods(), "encoder.wav2vec2.model.encoder.layers.0.attention.q_proj")?;
//! ```

use crate::error::{HarnessError, HarnessResult};
use crate::model::Module;
use std::fmt;
use std::str::FromStr;

/// One step of a module path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Named child (`encoder`, `q_proj`)
    Attr(String),
    /// Positional child of an indexed container (`3`)
    Index(usize),
}

impl PathSegment {
    pub fn attr(name: &str) -> Self {
        PathSegment::Attr(name.to_string())
    }

    fn parse(raw: &str) -> Self {
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = raw.parse::<usize>() {
                return PathSegment::Index(index);
            }
        }
        PathSegment::Attr(raw.to_string())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Attr(name) => write!(f, "{}", name),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

/// A parsed dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModulePath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl ModulePath {
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path of the parent module and the final segment.
    pub fn split_last(&self) -> HarnessResult<(&[PathSegment], &PathSegment)> {
        match self.segments.split_last() {
            Some((last, parent)) => Ok((parent, last)),
            None => Err(HarnessError::InvalidModulePath(self.raw.clone())),
        }
    }

    fn not_found(&self, segment: &PathSegment) -> HarnessError {
        HarnessError::ModuleNotFound {
            path: self.raw.clone(),
            segment: segment.to_string(),
        }
    }
}

impl FromStr for ModulePath {
    type Err = HarnessError;

    fn from_str(s: &str) -> HarnessResult<Self> {
        if s.is_empty() || s.split('.').any(|segment| segment.is_empty()) {
            return Err(HarnessError::InvalidModulePath(s.to_string()));
        }
        Ok(Self {
            raw: s.to_string(),
            segments: s.split('.').map(PathSegment::parse).collect(),
        })
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Resolve `path` below `root`.
pub fn get_module<'a>(root: &'a dyn Module, path: &str) -> HarnessResult<&'a dyn Module> {
    let path: ModulePath = path.parse()?;
    let mut current = root;
    for segment in path.segments() {
        current = match current.child(segment) {
            Some(child) => child,
            None => return Err(path.not_found(segment)),
        };
    }
    Ok(current)
}

/// Resolve `path` below `root` for mutation.
pub fn get_module_mut<'a>(root: &'a mut dyn Module, path: &str) -> HarnessResult<&'a mut dyn Module> {
    Ok(module_slot_mut(root, path)?.as_mut())
}

/// Resolve the slot that owns the module at `path`.
pub fn module_slot_mut<'a>(
    root: &'a mut dyn Module,
    path: &str,
) -> HarnessResult<&'a mut Box<dyn Module>> {
    let path: ModulePath = path.parse()?;
    let (parents, last) = path.split_last()?;

    let mut current = root;
    for segment in parents {
        current = match current.child_slot(segment) {
            Some(slot) => slot.as_mut(),
            None => return Err(path.not_found(segment)),
        };
    }
    match current.child_slot(last) {
        Some(slot) => Ok(slot),
        None => Err(path.not_found(last)),
    }
}

/// Replace the module at `path` and hand back the previous one.
pub fn set_module(
    root: &mut dyn Module,
    path: &str,
    new_module: Box<dyn Module>,
) -> HarnessResult<Box<dyn Module>> {
    let slot = module_slot_mut(root, path)?;
    Ok(std::mem::replace(slot, new_module))
}

/// Move the module at `path` into `wrap` and store the result in its place.
pub fn wrap_module<F>(root: &mut dyn Module, path: &str, wrap: F) -> HarnessResult<()>
where
    F: FnOnce(Box<dyn Module>) -> Box<dyn Module>,
{
    let slot = module_slot_mut(root, path)?;
    let inner = std::mem::replace(slot, Box::new(crate::model::layers::Identity));
    *slot = wrap(inner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::containers::{Block, Sequential};
    use crate::model::layers::{Identity, Transpose};
    use crate::model::ModuleKind;
    use crate::testing::linear;

    /// root
    /// ├── attr (Block)
    /// │   └── my_list (Sequential)
    /// │       ├── 0: Identity
    /// │       ├── 1: Transpose
    /// │       └── 2: Block { attr1: Block { attr2: Linear } }
    /// └── head: Linear
    fn nested_tree() -> Block {
        let innermost = Block::new().with("attr2", Box::new(linear(4, 4, 0.5)));
        let nested = Block::new().with("attr1", Box::new(innermost));
        let my_list = Sequential::new(vec![
            Box::new(Identity),
            Box::new(Transpose::new(1, 2)),
            Box::new(nested),
        ]);
        Block::new()
            .with("attr", Box::new(Block::new().with("my_list", Box::new(my_list))))
            .with("head", Box::new(linear(4, 2, 1.0)))
    }

    #[test]
    fn test_parse_segments() {
        let path: ModulePath = "encoder.layers.12.q_proj".parse().unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::attr("encoder"),
                PathSegment::attr("layers"),
                PathSegment::Index(12),
                PathSegment::attr("q_proj"),
            ]
        );
    }

    #[test]
    fn test_mixed_segments_stay_attributes() {
        let path: ModulePath = "linear1.w".parse().unwrap();
        assert_eq!(path.segments()[0], PathSegment::attr("linear1"));
    }

    #[test]
    fn test_rejects_empty_paths() {
        assert!("".parse::<ModulePath>().is_err());
        assert!("encoder..enc".parse::<ModulePath>().is_err());
        assert!("encoder.".parse::<ModulePath>().is_err());
    }

    #[test]
    fn test_get_single_attr() {
        let tree = nested_tree();
        let head = get_module(&tree, "head").unwrap();
        assert_eq!(head.kind(), ModuleKind::Linear);
    }

    #[test]
    fn test_get_element_by_index() {
        let tree = nested_tree();
        let element = get_module(&tree, "attr.my_list.1").unwrap();
        assert_eq!(element.kind(), ModuleKind::Transpose);
    }

    #[test]
    fn test_nested_attr_and_index() {
        let tree = nested_tree();
        let leaf = get_module(&tree, "attr.my_list.2.attr1.attr2").unwrap();
        assert_eq!(leaf.kind(), ModuleKind::Linear);
    }

    #[test]
    fn test_missing_segment_is_reported() {
        let tree = nested_tree();
        match get_module(&tree, "attr.my_list.7.attr1") {
            Err(HarnessError::ModuleNotFound { path, segment }) => {
                assert_eq!(path, "attr.my_list.7.attr1");
                assert_eq!(segment, "7");
            }
            other => panic!("expected ModuleNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_index_into_named_block_fails() {
        let tree = nested_tree();
        assert!(get_module(&tree, "attr.0").is_err());
    }

    #[test]
    fn test_set_single_attr() {
        let mut tree = nested_tree();
        let previous = set_module(&mut tree, "head", Box::new(Identity)).unwrap();
        assert_eq!(previous.kind(), ModuleKind::Linear);
        assert_eq!(get_module(&tree, "head").unwrap().kind(), ModuleKind::Identity);
    }

    #[test]
    fn test_set_element_by_index() {
        let mut tree = nested_tree();
        set_module(&mut tree, "attr.my_list.0", Box::new(linear(4, 4, 2.0))).unwrap();
        assert_eq!(
            get_module(&tree, "attr.my_list.0").unwrap().kind(),
            ModuleKind::Linear
        );
        // Siblings are untouched
        assert_eq!(
            get_module(&tree, "attr.my_list.1").unwrap().kind(),
            ModuleKind::Transpose
        );
    }

    #[test]
    fn test_set_nested_attr_and_index() {
        let mut tree = nested_tree();
        set_module(&mut tree, "attr.my_list.2.attr1.attr2", Box::new(Identity)).unwrap();
        assert_eq!(
            get_module(&tree, "attr.my_list.2.attr1.attr2").unwrap().kind(),
            ModuleKind::Identity
        );
    }

    #[test]
    fn test_set_missing_parent_fails() {
        let mut tree = nested_tree();
        assert!(set_module(&mut tree, "attr.missing.attr2", Box::new(Identity)).is_err());
    }

    #[test]
    fn test_wrap_module_keeps_inner() {
        let mut tree = nested_tree();
        wrap_module(&mut tree, "attr.my_list", |inner| {
            Box::new(Block::new().with("wrapped", inner))
        })
        .unwrap();
        let element = get_module(&tree, "attr.my_list.wrapped.1").unwrap();
        assert_eq!(element.kind(), ModuleKind::Transpose);
    }

    #[test]
    fn test_get_module_mut_allows_replacement_below() {
        let mut tree = nested_tree();
        let list = get_module_mut(&mut tree, "attr.my_list").unwrap();
        assert_eq!(list.kind(), ModuleKind::Sequential);
        set_module(list, "2", Box::new(Identity)).unwrap();
        assert_eq!(
            get_module(&tree, "attr.my_list.2").unwrap().kind(),
            ModuleKind::Identity
        );
    }
}
