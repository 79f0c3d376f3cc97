//! Umbrella crate for Chronicle.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on a single
//! crate name (`chronicle`).

pub use chronicle_engine as engine;
pub use chronicle_protocol as protocol;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexports_resolve() {
        let r = engine::dice::classify(vec![6], vec![10, 10]);
        assert!(r.messy_critical);
        let out = engine::annotate(Some("==x=="), &[], protocol::Variant::EditorPreview);
        assert!(out.content.contains("<mark"));
    }
}
