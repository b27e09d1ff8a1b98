pub(crate) mod allocator;
pub(crate) mod central_free_list;
pub(crate) mod cpu_cache;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod page_heap;
pub(crate) mod page_map;
pub(crate) mod params;
pub(crate) mod size_class;
pub(crate) mod span;
pub(crate) mod stats;
pub(crate) mod transfer_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
