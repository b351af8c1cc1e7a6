use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("dmsgprims {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: dmsgprims");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("DMSGPRIMS_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "wire: header={} align={} header_max={} aux_max={}",
        dmsgprims_frame::HDR_SIZE,
        dmsgprims_frame::ALIGN,
        dmsgprims_frame::HDR_MAX,
        dmsgprims_frame::AUX_MAX
    );
    println!("features: iocom={}, cli=true", cfg!(feature = "iocom"));

    Ok(SUCCESS)
}
