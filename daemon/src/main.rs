use std::process;
use std::sync::Arc;
use std::thread;

use log::{error, info};

use brewd::ipc::MessageReceiver;
use brewd::launch::LaunchInterceptor;
use brewd::registry::HandlerRegistries;
use brewd::{config, logging, platform};

fn main() {
    logging::init();
    info!("brewd starting");

    let platform = match platform::native() {
        Ok(platform) => platform,
        Err(e) => {
            error!("cannot start: {e}");
            process::exit(1);
        }
    };

    let registries = Arc::new(HandlerRegistries::new(platform.messaging.clone()));

    let receiver = MessageReceiver::new(platform.messaging, registries.clone());
    thread::spawn(move || receiver.run());

    let interceptor = LaunchInterceptor::new(
        registries,
        platform.controller,
        platform.directory,
        config::SOCKET_PATH,
    );
    if let Err(e) = interceptor.run() {
        error!("launch interception failed: {e}");
        process::exit(1);
    }
}
