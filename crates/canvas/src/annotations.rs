use std::sync::Arc;

use protocol::AnnotationId;

/// A floating text box anchored to canvas coordinates. Annotations never
/// affect pixel data; they ride along in the canvas state so undo covers
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub id: AnnotationId,
    pub x: i32,
    pub y: i32,
    pub width: u16,
    pub height: u16,
    pub background_color: u32,
    pub flags: u8,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationList {
    entries: Vec<Arc<Annotation>>,
}

impl AnnotationList {
    pub fn new() -> AnnotationList {
        AnnotationList::default()
    }

    pub fn entries(&self) -> &[Arc<Annotation>] {
        &self.entries
    }

    pub fn find(&self, id: AnnotationId) -> Option<&Arc<Annotation>> {
        self.entries.iter().find(|annotation| annotation.id == id)
    }

    pub fn insert(&mut self, annotation: Annotation) -> bool {
        if self.find(annotation.id).is_some() {
            return false;
        }
        self.entries.push(Arc::new(annotation));
        true
    }

    pub fn update(
        &mut self,
        id: AnnotationId,
        apply: impl FnOnce(&mut Annotation),
    ) -> bool {
        match self.entries.iter_mut().find(|annotation| annotation.id == id) {
            Some(entry) => {
                apply(Arc::make_mut(entry));
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: AnnotationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|annotation| annotation.id != id);
        self.entries.len() != before
    }
}

/// Document-wide settings carried in the canvas state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub dpix: i32,
    pub dpiy: i32,
    pub framerate: i32,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            dpix: 72,
            dpiy: 72,
            framerate: 24,
        }
    }
}
