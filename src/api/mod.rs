pub mod cluster;
pub mod node;
pub mod node_pool;
pub mod node_template;
pub mod plan;

/// API group of every management resource this controller reads or writes.
pub static MANAGEMENT_GROUP: &str = "management.cattle.io";

/// Version string used in owner references pointing at management resources.
pub static MANAGEMENT_API_VERSION: &str = "management.cattle.io/v3";

/// Annotation carrying the id of the user that created a resource.
pub static CREATOR_ID_ANNOTATION: &str = "field.cattle.io/creatorId";

/// Resources that point at a node template through a `namespace:name` field.
pub trait NodeTemplateRef {
    fn node_template_ref(&self) -> Option<&str>;

    fn set_node_template_ref(&mut self, reference: String);

    fn references(&self, reference: &str) -> bool {
        self.node_template_ref() == Some(reference)
    }
}
