//! Code buffer for building JIT code.
//!
//! Besides the bytes themselves, the buffer owns the labels used by jumps,
//! the offsets of embedded object references and optional comments.

/// Handle to a position in the code, possibly not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Encoding size requested for a jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    /// 8-bit displacement; the target must be within a short jump.
    Near,
    /// 32-bit displacement.
    Far,
}

/// Size of a reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceSize {
    Rel8,
    Rel32,
}

impl ReferenceSize {
    fn width(self) -> usize {
        match self {
            ReferenceSize::Rel8 => 1,
            ReferenceSize::Rel32 => 4,
        }
    }
}

#[derive(Debug, Default)]
struct LabelState {
    position: Option<usize>,
    /// References emitted before the label was bound.
    unresolved: Vec<(usize, ReferenceSize)>,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    /// Offsets of 64-bit immediates that hold object references.
    objects: Vec<usize>,
    comments: Vec<(usize, String)>,
    /// First encoding failure; reported by [`CodeBuffer::verify`].
    error: Option<String>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset and patch every pending reference.
    pub fn bind(&mut self, label: Label) {
        let target = self.code.len();
        let state = &mut self.labels[label.0];
        if state.position.is_some() {
            self.fail(format!("label L{} bound twice", label.0));
            return;
        }
        state.position = Some(target);
        let unresolved = std::mem::take(&mut state.unresolved);
        for (offset, size) in unresolved {
            self.patch(label, offset, size, target);
        }
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].position.is_some()
    }

    /// Whether references to `label` are still waiting for it to be bound.
    pub fn is_linked(&self, label: Label) -> bool {
        !self.labels[label.0].unresolved.is_empty()
    }

    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels[label.0].position
    }

    /// Emit the displacement field of a jump to `label`.
    ///
    /// Must be the last field of the instruction: displacements are
    /// relative to the end of the field.
    pub fn emit_label_ref(&mut self, label: Label, distance: Distance) {
        let size = match distance {
            Distance::Near => ReferenceSize::Rel8,
            Distance::Far => ReferenceSize::Rel32,
        };
        let offset = self.code.len();
        self.code.extend(std::iter::repeat_n(0, size.width()));
        match self.labels[label.0].position {
            Some(target) => self.patch(label, offset, size, target),
            None => self.labels[label.0].unresolved.push((offset, size)),
        }
    }

    fn patch(&mut self, label: Label, offset: usize, size: ReferenceSize, target: usize) {
        let rel = target as i64 - (offset + size.width()) as i64;
        match size {
            ReferenceSize::Rel8 => match i8::try_from(rel) {
                Ok(rel) => self.code[offset] = rel as u8,
                Err(_) => self.fail(format!(
                    "near jump to label L{} at {offset:#x} out of range ({rel} bytes)",
                    label.0
                )),
            },
            ReferenceSize::Rel32 => match i32::try_from(rel) {
                Ok(rel) => self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes()),
                Err(_) => self.fail(format!("jump to label L{} out of range", label.0)),
            },
        }
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    /// Note that the 64-bit immediate just emitted is an object reference.
    pub fn record_object(&mut self) {
        self.objects.push(self.code.len() - 8);
    }

    pub fn objects(&self) -> &[usize] {
        &self.objects
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.comments.push((self.code.len(), text.into()));
    }

    pub fn comments(&self) -> &[(usize, String)] {
        &self.comments
    }

    /// Check that every encoding succeeded and no label is left with
    /// unresolved references.
    pub fn verify(&self) -> Result<(), String> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        for (i, state) in self.labels.iter().enumerate() {
            if !state.unresolved.is_empty() {
                return Err(format!(
                    "label L{i} has {} unresolved reference(s)",
                    state.unresolved.len()
                ));
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}
