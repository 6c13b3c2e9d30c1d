use std::os::fd::AsRawFd;

use log::info;

use seatmux::config::Config;
use seatmux::event_loop::Event;
use seatmux::Server;

fn init_log(loglevel: &str) {
    let level = match loglevel {
        "silent" => log::LevelFilter::Off,
        "debug" => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn main() {
    let config = Config::new();
    init_log(&config.loglevel);

    let mut server = Server::new(config.vt_bound).unwrap();
    server.listen(&config.socket_path).unwrap();

    let (quit_read, quit_write) = seatmux::pipe().unwrap();
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGTERM, quit_write.as_raw_fd())
        .unwrap();
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, quit_write.as_raw_fd())
        .unwrap();

    // The kernel delivers VT release/acquire requests for process-controlled
    // switching as SIGUSR1/SIGUSR2.
    let (release_read, release_write) = seatmux::pipe().unwrap();
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGUSR1, release_write.as_raw_fd())
        .unwrap();
    let (acquire_read, acquire_write) = seatmux::pipe().unwrap();
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGUSR2, acquire_write.as_raw_fd())
        .unwrap();

    server.register_signal_fd(quit_read, Event::Quit).unwrap();
    server
        .register_signal_fd(release_read, Event::VtRelease)
        .unwrap();
    server
        .register_signal_fd(acquire_read, Event::VtAcquire)
        .unwrap();

    info!("seatmux started");
    server.run().unwrap();
}
