use bitflags::bitflags;

bitflags! {
    /// Tracked resource state, one bit per usage class. Transition barriers
    /// move a resource between states; a barrier is required whenever the
    /// tracked state does not already include the expected one.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 1 << 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const DEPTH_WRITE = 1 << 5;
        const DEPTH_READ = 1 << 6;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 7;
        const PIXEL_SHADER_RESOURCE = 1 << 8;
        const COPY_DEST = 1 << 9;
        const COPY_SOURCE = 1 << 10;
        const ACCELERATION_STRUCTURE = 1 << 11;

        /// Present is common as far as the hardware is concerned.
        const PRESENT = Self::COMMON.bits();
        const ALL_SHADER_RESOURCE =
            Self::NON_PIXEL_SHADER_RESOURCE.bits() | Self::PIXEL_SHADER_RESOURCE.bits();
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::ALL_SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits();

        /// States a pass may declare on an input.
        const READ_STATES = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::DEPTH_READ.bits()
            | Self::ALL_SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits()
            | Self::ACCELERATION_STRUCTURE.bits();

        /// States a pass may declare on an output.
        const WRITE_STATES = Self::RENDER_TARGET.bits()
            | Self::UNORDERED_ACCESS.bits()
            | Self::DEPTH_WRITE.bits()
            | Self::COPY_DEST.bits()
            | Self::ACCELERATION_STRUCTURE.bits();

        /// Graphics-only states; transitions touching these cannot be
        /// recorded on a compute command list.
        const INVALID_COMPUTE_STATES = Self::RENDER_TARGET.bits()
            | Self::DEPTH_WRITE.bits()
            | Self::DEPTH_READ.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits();
    }
}

impl ResourceState {
    /// Sentinel for resources whose state has never been tracked.
    pub const UNKNOWN: Self = Self::empty();

    pub fn is_read(&self) -> bool {
        Self::READ_STATES.contains(*self)
    }

    pub fn is_write(&self) -> bool {
        Self::WRITE_STATES.intersects(*self)
    }

    pub fn legal_on_compute(&self) -> bool {
        !self.intersects(Self::INVALID_COMPUTE_STATES)
    }

    pub fn name(&self) -> &'static str {
        const NAMES: &[(ResourceState, &str)] = &[
            (ResourceState::COMMON, "COMMON_OR_PRESENT"),
            (ResourceState::VERTEX_AND_CONSTANT_BUFFER, "VERTEX_AND_CONSTANT_BUFFER"),
            (ResourceState::INDEX_BUFFER, "INDEX_BUFFER"),
            (ResourceState::RENDER_TARGET, "RENDER_TARGET"),
            (ResourceState::UNORDERED_ACCESS, "UNORDERED_ACCESS"),
            (ResourceState::DEPTH_WRITE, "DEPTH_WRITE"),
            (ResourceState::DEPTH_READ, "DEPTH_READ"),
            (ResourceState::NON_PIXEL_SHADER_RESOURCE, "NON_PIXEL_SHADER_RESOURCE"),
            (ResourceState::PIXEL_SHADER_RESOURCE, "PIXEL_SHADER_RESOURCE"),
            (ResourceState::COPY_DEST, "COPY_DEST"),
            (ResourceState::COPY_SOURCE, "COPY_SOURCE"),
            (ResourceState::ACCELERATION_STRUCTURE, "RAYTRACING_ACCELERATION_STRUCTURE"),
            (ResourceState::ALL_SHADER_RESOURCE, "ALL_SHADER_RESOURCE"),
            (ResourceState::GENERIC_READ, "GENERIC_READ"),
        ];
        NAMES
            .iter()
            .find(|(state, _)| *state == *self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_classify_states() {
        assert!(ResourceState::NON_PIXEL_SHADER_RESOURCE.is_read());
        assert!(ResourceState::UNORDERED_ACCESS.is_write());
        assert!(!ResourceState::RENDER_TARGET.is_read());
        assert!(!ResourceState::NON_PIXEL_SHADER_RESOURCE.is_write());
        // compound read states pass the read mask
        assert!(ResourceState::ALL_SHADER_RESOURCE.is_read());
    }

    #[test]
    fn compute_legality() {
        assert!(ResourceState::UNORDERED_ACCESS.legal_on_compute());
        assert!(ResourceState::NON_PIXEL_SHADER_RESOURCE.legal_on_compute());
        assert!(!ResourceState::DEPTH_WRITE.legal_on_compute());
        assert!(!ResourceState::RENDER_TARGET.legal_on_compute());
        assert!(!ResourceState::PIXEL_SHADER_RESOURCE.legal_on_compute());
    }

    #[test]
    fn present_aliases_common() {
        assert_eq!(ResourceState::PRESENT, ResourceState::COMMON);
    }
}
