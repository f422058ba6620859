mod common;

use std::time::Duration;

use common::open_device;
use shuttle_audio_rs::audio::{
    AudioStream, BufferType, CaptureEndpoint, DeviceMask, HalError, PcmDirection,
    PlaybackEndpoint, PortId, StreamConfig,
};

fn stereo(frames: usize) -> Vec<i16> {
    (0..frames).flat_map(|i| [i as i16, -(i as i16)]).collect()
}

#[test]
fn port_rate_stream_needs_no_converter() {
    let h = open_device();
    let mut config = StreamConfig {
        sample_rate: 44100,
        channels: 2,
    };
    let out = h.device.open_output_stream(&mut config).unwrap();

    let data = stereo(880);
    assert_eq!(out.write(&data).unwrap(), data.len() * 2);

    assert!(!out.has_converter());
    assert_eq!(out.converter_buffer_frames(), 0);
    assert_eq!(h.converters.created(), 0);
    assert!(!out.is_standby());

    let opens = h.driver.opens();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].port, PortId::Main);
    assert_eq!(opens[0].direction, PcmDirection::Playback);
    assert_eq!(opens[0].config.rate, 44100);
    assert_eq!(h.driver.with(|s| s.frames_written), 880);
}

#[test]
fn sixteen_khz_stream_gets_a_converter() {
    let h = open_device();
    let mut config = StreamConfig {
        sample_rate: 16000,
        channels: 2,
    };
    let out = h.device.open_output_stream(&mut config).unwrap();
    out.write(&stereo(320)).unwrap();

    assert!(out.has_converter());
    // 880 * 44100 / 16000 + 1
    assert_eq!(out.converter_buffer_frames(), 2426);
    assert_eq!(
        h.converters.requests.lock().unwrap().as_slice(),
        &[(16000, 44100, 2)]
    );
    // 320 frames at 16 kHz come out as 882 at 44.1 kHz
    assert_eq!(h.driver.with(|s| s.frames_written), 882);
}

#[test]
fn zero_rate_takes_the_port_rate() {
    let h = open_device();
    let mut config = StreamConfig::default();
    let out = h.device.open_output_stream(&mut config).unwrap();
    assert_eq!(config, StreamConfig { sample_rate: 44100, channels: 2 });
    assert_eq!(out.sample_rate(), 44100);
    assert_eq!(out.channels(), 2);
    assert_eq!(out.frame_size(), 4);
    assert_eq!(out.buffer_size(), 880 * 4);
    assert!(out.is_standby());
    assert!(out.set_sample_rate(48000).is_err());
}

#[test]
fn speaker_to_headphone_keeps_the_stream_running() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();

    out.set_parameters("routing=8").unwrap();

    assert!(!out.is_standby());
    assert_eq!(
        h.device.devices(),
        DeviceMask::OUT_WIRED_HEADPHONE | DeviceMask::IN_BUILTIN_MIC
    );
    assert_eq!(h.mixer.value("Headphone Jack Switch"), vec![1, 1]);
    assert_eq!(h.mixer.value("Internal Speaker Switch"), vec![0, 0]);

    out.write(&stereo(880)).unwrap();
    assert_eq!(h.driver.opens().len(), 1);
}

#[test]
fn routing_onto_sco_reopens_on_the_sco_port() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();

    out.set_parameters("routing=16").unwrap();
    assert!(out.is_standby());

    let before = h.driver.with(|s| s.frames_written);
    out.write(&stereo(256)).unwrap();
    let opens = h.driver.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1].port, PortId::Sco);
    assert_eq!(opens[1].config.rate, 8000);
    assert_eq!(out.port_id(), PortId::Sco);
    assert!(out.has_converter());
    // downmixed to the mono SCO port
    let last = h.driver.with(|s| s.last_write.clone());
    // 256 frames at 44.1 kHz -> 46 at 8 kHz
    assert_eq!(last.len(), 46);
    assert_eq!(h.driver.with(|s| s.frames_written) - before, 46);
}

#[test]
fn routing_onto_aux_digital_uses_the_spdif_port() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();
    out.set_parameters("routing=1024").unwrap();
    assert!(out.is_standby());

    out.write(&stereo(880)).unwrap();
    assert_eq!(out.port_id(), PortId::Spdif);
}

#[test]
fn zero_or_unchanged_routing_is_ignored() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();
    let writes = h.mixer.writes();

    out.set_parameters("routing=0").unwrap();
    out.set_parameters("routing=2").unwrap();
    out.set_parameters("volume=3").unwrap();

    assert_eq!(h.mixer.writes(), writes);
    assert!(!out.is_standby());
    assert!(matches!(
        out.set_parameters("routing=speaker"),
        Err(HalError::InvalidArgument(_))
    ));
}

#[test]
fn underrun_reports_success_without_sleeping() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    h.driver.with(|s| s.underruns = 1);

    let data = stereo(880);
    assert_eq!(out.write(&data).unwrap(), data.len() * 2);
    assert_eq!(h.sleeper.count(), 0);
    assert!(!out.is_standby());
}

#[test]
fn write_failure_backs_off_for_the_buffer_duration() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    h.driver.with(|s| s.fail_io = true);

    let data = stereo(441);
    assert_eq!(out.write(&data).unwrap(), data.len() * 2);
    assert_eq!(h.sleeper.total(), Duration::from_millis(10));
}

#[test]
fn open_failure_stays_in_standby_and_backs_off() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    h.driver.with(|s| s.fail_open = true);

    let data = stereo(441);
    assert_eq!(out.write(&data).unwrap(), data.len() * 2);
    assert!(out.is_standby());
    assert_eq!(h.sleeper.total(), Duration::from_millis(10));

    h.driver.with(|s| s.fail_open = false);
    out.write(&data).unwrap();
    assert!(!out.is_standby());
}

#[test]
fn partial_frames_are_rejected() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    assert!(matches!(
        out.write(&[1, 2, 3]),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(out.is_standby());
}

#[test]
fn screen_off_without_capture_selects_long_buffers() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    assert_eq!(out.latency_ms(), 39);

    out.write(&stereo(880)).unwrap();
    assert_eq!(out.buffer_type(), BufferType::Short);
    assert_eq!(out.write_thresholds(), (1760, 1760));

    h.device.set_parameters("screen_state=off").unwrap();
    assert_eq!(out.latency_ms(), 159);
    out.write(&stereo(880)).unwrap();
    assert_eq!(out.buffer_type(), BufferType::Long);
    // the target moves at once, the current threshold follows in steps
    assert_eq!(out.write_thresholds(), (7040, 1760 + 220));
}

#[test]
fn active_capture_keeps_short_buffers() {
    let h = open_device();
    h.device.set_parameters("screen_state=off").unwrap();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    let input = h
        .device
        .open_input_stream(&mut StreamConfig {
            sample_rate: 44100,
            channels: 1,
        })
        .unwrap();
    let mut buf = vec![0i16; 1024];
    input.read(&mut buf).unwrap();

    out.write(&stereo(880)).unwrap();
    assert_eq!(out.buffer_type(), BufferType::Short);
    assert_eq!(out.latency_ms(), 39);
}

#[test]
fn first_write_after_standby_starts_from_the_target() {
    let h = open_device();
    h.device.set_parameters("screen_state=off").unwrap();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();
    assert_eq!(out.buffer_type(), BufferType::Long);
    // an empty kernel buffer pulls the current threshold down to just over
    // one period
    assert_eq!(out.write_thresholds(), (7040, 880 + 220));

    out.standby();
    assert!(out.is_standby());
    h.device.set_parameters("screen_state=on").unwrap();
    out.write(&stereo(880)).unwrap();
    assert_eq!(out.write_thresholds(), (1760, 1760));
}

#[test]
fn full_kernel_buffer_is_paced() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();
    assert_eq!(h.sleeper.count(), 0);

    // 7040-frame ring with 880 free: 6160 queued, 4400 over the threshold
    h.driver.with(|s| s.avail = Some(880));
    out.write(&stereo(880)).unwrap();
    assert_eq!(h.sleeper.total(), Duration::from_micros(39909));
}

#[test]
fn volume_drives_speaker_and_headphone_controls() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.set_volume(1.0, 0.5).unwrap();
    assert_eq!(h.mixer.value("Speaker Playback Volume"), vec![31, 15]);
    assert_eq!(h.mixer.value("Headphone Playback Volume"), vec![31, 15]);
    assert!(out.render_position().is_err());
}

#[test]
fn close_puts_the_stream_in_standby() {
    let h = open_device();
    let out = h
        .device
        .open_output_stream(&mut StreamConfig::default())
        .unwrap();
    out.write(&stereo(880)).unwrap();
    h.device.close_output_stream(out.clone());
    assert!(out.is_standby());
}
