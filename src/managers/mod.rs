#[cfg(feature = "manager-cacache")]
pub(crate) mod cacache;

#[cfg(feature = "manager-moka")]
pub(crate) mod moka;
