//! Wi-Fi station and network stack.

use alloc::string::String;

use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, DhcpConfig, Runner, Stack, StackResources};
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_radio::Controller as RadioController;
use esp_radio::wifi::{self, ClientConfig, ModeConfig, WifiController, WifiDevice, WifiEvent};
use log::{info, warn};
use static_cell::StaticCell;

use crate::config::{WIFI_PASSWORD, WIFI_SSID};

static RADIO_CONTROLLER: StaticCell<RadioController<'static>> = StaticCell::new();
// One HTTP socket, one SNTP socket, DHCP
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();

/// Bring up the radio and spawn the Wi-Fi and network runner tasks.
///
/// Returns `None` if the radio cannot be initialised. The meter keeps
/// counting without a network in that case.
pub fn start(spawner: &Spawner, wifi_peripheral: WIFI<'static>) -> Option<Stack<'static>> {
    let radio = match esp_radio::init() {
        Ok(ctrl) => ctrl,
        Err(err) => {
            warn!("Wi-Fi radio init failed; running without network: {:?}", err);
            return None;
        }
    };
    let radio_ctrl = RADIO_CONTROLLER.init(radio);

    let (controller, interfaces) = match wifi::new(radio_ctrl, wifi_peripheral, Default::default())
    {
        Ok(v) => v,
        Err(err) => {
            warn!("Wi-Fi driver init failed; running without network: {:?}", err);
            return None;
        }
    };

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let resources = NET_RESOURCES.init(StackResources::<4>::new());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(DhcpConfig::default()),
        resources,
        seed,
    );

    spawner.spawn(wifi_task(controller, stack).expect("wifi_task spawn"));
    spawner.spawn(net_task(runner).expect("net_task spawn"));
    Some(stack)
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

#[embassy_executor::task]
async fn wifi_task(mut controller: WifiController<'static>, stack: Stack<'static>) {
    info!("Wi-Fi task starting (ssid=\"{}\")", WIFI_SSID);

    loop {
        if !matches!(controller.is_started(), Ok(true)) {
            let client_config = ModeConfig::Client(
                ClientConfig::default()
                    .with_ssid(String::from(WIFI_SSID))
                    .with_password(String::from(WIFI_PASSWORD)),
            );
            if let Err(err) = controller.set_config(&client_config) {
                warn!("Wi-Fi set_config error: {:?}", err);
                Timer::after(Duration::from_secs(10)).await;
                continue;
            }

            info!("Starting Wi-Fi STA");
            if let Err(err) = controller.start_async().await {
                warn!("Wi-Fi start_async error: {:?}", err);
                Timer::after(Duration::from_secs(10)).await;
                continue;
            }
        }

        match controller.connect_async().await {
            Ok(()) => {
                stack.wait_config_up().await;
                if let Some(cfg) = stack.config_v4() {
                    info!("Wi-Fi link up: http://{}/", cfg.address.address());
                }

                controller.wait_for_event(WifiEvent::StaDisconnected).await;
                warn!("Wi-Fi STA disconnected; will retry");
                Timer::after(Duration::from_secs(5)).await;
            }
            Err(err) => {
                warn!("Wi-Fi connect_async error: {:?}", err);
                Timer::after(Duration::from_secs(10)).await;
            }
        }
    }
}
