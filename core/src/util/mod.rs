pub(crate) mod weakcache;
