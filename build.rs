#[cfg(feature = "verbs")]
mod verbs {
    use std::env::{self, consts};
    use std::path::{Path, PathBuf};

    /// Libraries the hardware backend links against, with the `pkg-config`
    /// version floors of rdma-core v28.
    const LIBS: [(&str, &str); 2] = [("libibverbs", "1.8.28"), ("librdmacm", "1.2.28")];

    /// Try `pkg-config` first. Return the include paths on success.
    fn find_with_pkg_config() -> Result<Vec<PathBuf>, ()> {
        let mut include_dirs = Vec::new();
        for (name, version) in LIBS {
            let lib = pkg_config::Config::new()
                .atleast_version(version)
                .statik(false)
                .probe(name)
                .map_err(|_| ())?;
            include_dirs.extend(lib.include_paths);
        }
        Ok(include_dirs)
    }

    /// Older `MLNX_OFED` releases do not register their libraries to
    /// `pkg-config`, so search for them manually.
    ///
    /// We assume the default installation path as `/usr/lib`.
    fn find_manually() -> Result<Vec<PathBuf>, ()> {
        let lib_dir = match env::var("MLNX_OFED_LIB_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => Path::new("/usr/lib").to_owned(),
        };
        for (name, _) in LIBS {
            let short = name.trim_start_matches("lib");
            let dylib = format!("{}{}{}", consts::DLL_PREFIX, short, consts::DLL_SUFFIX);
            if !lib_dir.join(dylib).exists() && !lib_dir.join(format!("{}.a", name)).exists() {
                return Err(());
            }
        }
        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=rdmacm");
        Ok(env::var("MLNX_OFED_INCLUDE_DIR")
            .map(|dir| vec![PathBuf::from(dir)])
            .unwrap_or_default())
    }

    fn gen_bindings(include_dirs: &[PathBuf]) {
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p.display()));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_function("rdma_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("rdma_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("sockaddr")
            .blocklist_type("sockaddr_in")
            .blocklist_type("sockaddr_in6")
            .blocklist_type("sockaddr_storage")
            .blocklist_type("in_addr")
            .blocklist_type("in6_addr")
            .blocklist_type("timespec")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_qp_attr_mask")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("ibv_wr_opcode")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("rdma_cm_event_type")
            .constified_enum_module("rdma_port_space")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }

    /// Build flow:
    ///
    /// 1. Try to find `libibverbs` and `librdmacm` with `pkg-config`.
    /// 2. If failed, look for them in `MLNX_OFED_LIB_DIR` (or `/usr/lib`).
    pub fn main() {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_LIB_DIR");

        let include_dirs = find_with_pkg_config()
            .or_else(|_| find_manually())
            .expect("the `verbs` feature needs libibverbs and librdmacm installed");
        gen_bindings(&include_dirs);
    }
}

fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rwbench` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "verbs")]
    verbs::main();
}
