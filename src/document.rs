//! In-process document model
//!
//! A small node tree standing in for a live page: container nodes and image
//! nodes, with mutations published on a broadcast channel so discovery can
//! follow insertions, removals and image loads as they happen.

use image::codecs::gif::GifDecoder;
use image::AnimationDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{DetectorError, Result};

pub type NodeId = u64;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Raster,
    Animated,
    Vector,
}

#[derive(Debug, Clone)]
pub struct ImageElement {
    pub source: String,
    pub natural_width: u32,
    pub natural_height: u32,
    pub format: ImageFormat,
    pub loaded: bool,
    /// Decoded RGBA8 pixels, present once the image has loaded
    pub pixels: Option<Arc<Vec<u8>>>,
}

impl ImageElement {
    /// Loaded raster image with its decoded pixels
    pub fn raster(source: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            natural_width: width,
            natural_height: height,
            format: ImageFormat::Raster,
            loaded: true,
            pixels: Some(Arc::new(pixels)),
        }
    }

    /// Image whose load has not completed yet; dimensions are unknown
    pub fn pending(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            natural_width: 0,
            natural_height: 0,
            format: ImageFormat::Raster,
            loaded: false,
            pixels: None,
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }
}

/// Subtree built off-document and attached in a single mutation
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub images: Vec<ImageElement>,
    pub children: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// A subtree was attached; lists every image node inside it
    Inserted { root: NodeId, images: Vec<NodeId> },
    /// A subtree was detached; lists every image node that went with it
    Removed { root: NodeId, images: Vec<NodeId> },
    /// An image finished loading
    Loaded(NodeId),
}

#[derive(Debug)]
enum NodeKind {
    Container,
    Image(ImageElement),
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
}

impl Tree {
    /// Image nodes under `root` in document order, `root` included
    fn images_under(&self, root: NodeId) -> Vec<NodeId> {
        let mut images = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if matches!(node.kind, NodeKind::Image(_)) {
                images.push(id);
            }
            stack.extend(node.children.iter().rev());
        }
        images
    }
}

pub struct Document {
    tree: RwLock<Tree>,
    next_id: AtomicU64,
    events: broadcast::Sender<DocumentEvent>,
}

impl Document {
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            Self::ROOT,
            Node {
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Container,
            },
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            tree: RwLock::new(tree),
            next_id: AtomicU64::new(Self::ROOT + 1),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: DocumentEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn allocate(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn attach(tree: &mut Tree, parent: NodeId, id: NodeId, kind: NodeKind) -> Result<()> {
        let parent_node = tree
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| DetectorError::InvalidInput(format!("no such node: {}", parent)))?;
        parent_node.children.push(id);
        tree.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                children: Vec::new(),
                kind,
            },
        );
        Ok(())
    }

    pub fn append_container(&self, parent: NodeId) -> Result<NodeId> {
        let id = self.allocate();
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        Self::attach(&mut tree, parent, id, NodeKind::Container)?;
        Ok(id)
    }

    pub fn append_image(&self, parent: NodeId, image: ImageElement) -> Result<NodeId> {
        let id = self.allocate();
        {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            Self::attach(&mut tree, parent, id, NodeKind::Image(image))?;
        }
        self.publish(DocumentEvent::Inserted {
            root: id,
            images: vec![id],
        });
        Ok(id)
    }

    /// Attach a whole fragment under `parent`; returns the fragment's root node.
    pub fn append_fragment(&self, parent: NodeId, fragment: Fragment) -> Result<NodeId> {
        let root = self.allocate();
        let images = {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            Self::attach(&mut tree, parent, root, NodeKind::Container)?;

            let mut pending = vec![(root, fragment)];
            while let Some((container, fragment)) = pending.pop() {
                for image in fragment.images {
                    let id = self.allocate();
                    Self::attach(&mut tree, container, id, NodeKind::Image(image))?;
                }
                for child in fragment.children {
                    let id = self.allocate();
                    Self::attach(&mut tree, container, id, NodeKind::Container)?;
                    pending.push((id, child));
                }
            }
            tree.images_under(root)
        };

        if !images.is_empty() {
            self.publish(DocumentEvent::Inserted { root, images });
        }
        Ok(root)
    }

    /// Detach `node` and everything under it
    pub fn remove(&self, node: NodeId) -> Result<()> {
        if node == Self::ROOT {
            return Err(DetectorError::InvalidInput("cannot remove the root".into()));
        }

        let images = {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            let parent = tree
                .nodes
                .get(&node)
                .ok_or_else(|| DetectorError::InvalidInput(format!("no such node: {}", node)))?
                .parent;
            let images = tree.images_under(node);

            if let Some(parent) = parent.and_then(|p| tree.nodes.get_mut(&p)) {
                parent.children.retain(|c| *c != node);
            }
            let mut stack = vec![node];
            while let Some(id) = stack.pop() {
                if let Some(removed) = tree.nodes.remove(&id) {
                    stack.extend(removed.children);
                }
            }
            images
        };

        self.publish(DocumentEvent::Removed { root: node, images });
        Ok(())
    }

    /// Complete an image load with its natural size and decoded pixels
    pub fn complete_load(&self, node: NodeId, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
        {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            match tree.nodes.get_mut(&node).map(|n| &mut n.kind) {
                Some(NodeKind::Image(image)) => {
                    image.natural_width = width;
                    image.natural_height = height;
                    image.pixels = Some(Arc::new(pixels));
                    image.loaded = true;
                }
                _ => {
                    return Err(DetectorError::InvalidInput(format!(
                        "node {} is not an image",
                        node
                    )))
                }
            }
        }
        self.publish(DocumentEvent::Loaded(node));
        Ok(())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .contains_key(&node)
    }

    pub fn image(&self, node: NodeId) -> Option<ImageElement> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        match &tree.nodes.get(&node)?.kind {
            NodeKind::Image(image) => Some(image.clone()),
            NodeKind::Container => None,
        }
    }

    /// Image nodes under `root` in document order
    pub fn images_under(&self, root: NodeId) -> Vec<NodeId> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .images_under(root)
    }

    /// Build a document from the image files in `dir`, one image node per file
    /// in file-name order. Undecodable files are logged and left out.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| DetectorError::Image(format!("{}: {}", dir.display(), e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let document = Self::new();
        for path in paths {
            match load_image_file(&path) {
                Ok(Some(image)) => {
                    debug!(
                        source = %image.source,
                        width = image.natural_width,
                        height = image.natural_height,
                        "Loaded image file"
                    );
                    document.append_image(Self::ROOT, image)?;
                }
                Ok(None) => debug!(path = %path.display(), "Ignoring non-image file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load image file"),
            }
        }

        info!(dir = %dir.display(), images = document.images_under(Self::ROOT).len(), "Document loaded");
        Ok(document)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

fn load_image_file(path: &Path) -> Result<Option<ImageElement>> {
    let source = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        // Vector images are never decoded, only recognized
        "svg" => Ok(Some(ImageElement {
            source,
            natural_width: 0,
            natural_height: 0,
            format: ImageFormat::Vector,
            loaded: true,
            pixels: None,
        })),
        "png" | "jpg" | "jpeg" | "webp" | "bmp" | "gif" => {
            let decoded = image::open(path)?.to_rgba8();
            let (width, height) = decoded.dimensions();
            let format = if extension == "gif" && is_animated_gif(path)? {
                ImageFormat::Animated
            } else {
                ImageFormat::Raster
            };
            Ok(Some(
                ImageElement::raster(source, width, height, decoded.into_raw()).with_format(format),
            ))
        }
        _ => Ok(None),
    }
}

fn is_animated_gif(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| DetectorError::Image(e.to_string()))?;
    let decoder = GifDecoder::new(BufReader::new(file))?;
    Ok(decoder.into_frames().take(2).count() > 1)
}
