//! Container modules: index-addressed [`Sequential`] and name-addressed [`Block`].
//!
//! Both chain their children in order and push the child's path segment onto
//! the forward scope while it runs.

use crate::error::HarnessResult;
use crate::model::{ForwardCtx, Module, ModuleKind, PathSegment};
use candle_core::Tensor;

/// Ordered list of modules addressed by position (`layers.0`, `layers.1`, ...).
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }

    pub fn push(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Sequential
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let mut hidden = xs.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            hidden = ctx.scoped(&PathSegment::Index(index), |ctx| layer.forward(&hidden, ctx))?;
        }
        Ok(hidden)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Index(index) => self.layers.get(*index).map(|layer| layer.as_ref()),
            PathSegment::Attr(_) => None,
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Index(index) => self.layers.get_mut(*index),
            PathSegment::Attr(_) => None,
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        self.layers
            .iter()
            .enumerate()
            .map(|(index, layer)| (PathSegment::Index(index), layer.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        self.layers
            .iter_mut()
            .enumerate()
            .map(|(index, layer)| (PathSegment::Index(index), layer))
            .collect()
    }
}

/// Named children run in insertion order.
///
/// ## Example:
/// ```rust,ignore
/// let projection = Block::new()
///     .with("layer_norm", Box::new(norm))
///     .with("projection", Box::new(linear));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Block {
    entries: Vec<(String, Box<dyn Module>)>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert. A repeated name replaces the earlier entry in place.
    pub fn with(mut self, name: &str, module: Box<dyn Module>) -> Self {
        self.insert(name, module);
        self
    }

    pub fn insert(&mut self, name: &str, module: Box<dyn Module>) {
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = module,
            None => self.entries.push((name.to_string(), module)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Module> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    fn position(&self, segment: &PathSegment) -> Option<usize> {
        // Numeric names are only reachable through index segments
        let key = segment.to_string();
        self.entries.iter().position(|(name, _)| *name == key)
    }
}

impl Module for Block {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Block
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let mut hidden = xs.clone();
        for (name, module) in &self.entries {
            let segment = PathSegment::Attr(name.clone());
            hidden = ctx.scoped(&segment, |ctx| module.forward(&hidden, ctx))?;
        }
        Ok(hidden)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        let position = self.position(segment)?;
        Some(self.entries[position].1.as_ref())
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        let position = self.position(segment)?;
        Some(&mut self.entries[position].1)
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        self.entries
            .iter()
            .map(|(name, module)| (PathSegment::Attr(name.clone()), module.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        self.entries
            .iter_mut()
            .map(|(name, module)| (PathSegment::Attr(name.clone()), module))
            .collect()
    }
}
