//! Runs the code samples in `README.md` as doctests.

macro_rules! readme_doc {
    ($text:expr) => {
        #[doc = $text]
        extern "C" {}
    };
}

readme_doc!(include_str!("../README.md"));
