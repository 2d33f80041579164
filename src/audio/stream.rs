// Stream CPAL - exécute l'Executor dans le callback temps-réel
//
// # Format Support
//
// Le device peut demander F32, I16 ou U16. L'executor travaille toujours en
// f32 entrelacé ; le callback convertit via un buffer scratch préalloué,
// par tranches si le device demande plus de frames que le scratch n'en
// contient.
//
// # Duplex
//
// cpal n'a pas de stream duplex : on ouvre un stream d'entrée et un stream
// de sortie. Le callback d'entrée pousse les frames capturées dans un ring
// buffer, le callback de sortie les en retire et les passe comme `input` à
// l'executor. La sortie cadence donc l'executor.
//
// # Stream Limitations
//
// Sur macOS (CoreAudio), le Stream n'est pas Send/Sync : le MixerStream doit
// rester sur le thread qui l'a créé. Les erreurs du driver arrivent par le
// callback d'erreur, qui met à jour le status et pousse une notification.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, SampleFormat, SizedSample, Stream, StreamConfig};
use log::{error, info};
use ringbuf::traits::{Consumer, Producer};
use std::sync::{Arc, Mutex};

use crate::audio::diagnostics::{CallbackLoad, EngineStats};
use crate::audio::executor::Executor;
use crate::audio::format_conversion::{read_interleaved, write_interleaved};
use crate::audio::status::{AtomicStreamStatus, StreamStatus};
use crate::error::{MixerError, MixerResult};
use crate::messaging::channels::{
    NotificationConsumer, NotificationProducer, create_notification_channel,
};
use crate::messaging::notification::Notification;
use crate::ringbuffer::{RingBuffer, RingReader, RingWriter};
use crate::session::{Session, SessionConfig};

/// Scratch size when the device does not report a fixed block size
const DEFAULT_SCRATCH_FRAMES: usize = 4096;

const NOTIFICATION_CAPACITY: usize = 64;

/// Capture ring size in driver blocks
const CAPTURE_BLOCKS: usize = 4;

/// A running cpal stream driving an [`Executor`].
///
/// Dropping it stops the stream and, with it, the executor.
pub struct MixerStream {
    _devices: Vec<Device>,
    _streams: Vec<Stream>,
    sample_rate: u32,
    input_channels: usize,
    output_channels: usize,
    pub status: AtomicStreamStatus,
    pub load: CallbackLoad,
    notifications: NotificationConsumer,
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Output,
    Input,
}

/// What the default device of one direction agreed to
struct DeviceSetup {
    device: Device,
    sample_format: SampleFormat,
    stream_config: StreamConfig,
    sample_rate: u32,
    channels: usize,
    scratch_frames: usize,
}

impl MixerStream {
    /// Open the default output device.
    ///
    /// The device's channel count and sample rate override those of
    /// `config`. The session has no input channels.
    pub fn output(config: &SessionConfig) -> MixerResult<(Session, MixerStream)> {
        Self::open(config, Direction::Output)
    }

    /// Open the default input device. The session has no output channels.
    pub fn input(config: &SessionConfig) -> MixerResult<(Session, MixerStream)> {
        Self::open(config, Direction::Input)
    }

    /// Open the default input and output devices together.
    ///
    /// The input device is asked for the output device's sample rate. Both
    /// channel counts come from the devices.
    pub fn duplex(config: &SessionConfig) -> MixerResult<(Session, MixerStream)> {
        let host = cpal::default_host();
        let output = setup_device(&host, Direction::Output, config.block_size, None)?;
        let input = setup_device(&host, Direction::Input, config.block_size, Some(output.sample_rate))?;

        let session_config = negotiated_config(
            config,
            output.sample_rate,
            input.channels,
            output.channels,
        );
        let (session, executor) = Session::new(&session_config)?;
        let stats = executor.engine_stats();

        let capacity = (output.scratch_frames.max(input.scratch_frames) * CAPTURE_BLOCKS)
            .next_power_of_two();
        let (capture_tx, capture_rx) =
            RingBuffer::<f32>::with_element_len(input.channels, capacity)?.split();

        let load = CallbackLoad::new(output.sample_rate, 10);
        let status = AtomicStreamStatus::new(StreamStatus::Starting);
        let (notification_tx, notifications) =
            create_notification_channel(NOTIFICATION_CAPACITY);
        let notification_tx = Arc::new(Mutex::new(notification_tx));

        let capture = CaptureParts {
            writer: capture_tx,
            channels: input.channels,
            scratch_frames: input.scratch_frames,
            stats,
            status: status.clone(),
            notification_tx: Arc::clone(&notification_tx),
        };
        let input_stream = match input.sample_format {
            SampleFormat::F32 => build_capture::<f32>(&input.device, &input.stream_config, capture),
            SampleFormat::I16 => build_capture::<i16>(&input.device, &input.stream_config, capture),
            SampleFormat::U16 => build_capture::<u16>(&input.device, &input.stream_config, capture),
            other => return Err(unsupported(other)),
        }?;

        let parts = CallbackParts {
            executor,
            channels: output.channels,
            scratch_frames: output.scratch_frames,
            load: load.clone(),
            status: status.clone(),
            notification_tx,
        };
        let output_stream = match output.sample_format {
            SampleFormat::F32 => build_duplex_output::<f32>(&output.device, &output.stream_config, parts, capture_rx),
            SampleFormat::I16 => build_duplex_output::<i16>(&output.device, &output.stream_config, parts, capture_rx),
            SampleFormat::U16 => build_duplex_output::<u16>(&output.device, &output.stream_config, parts, capture_rx),
            other => return Err(unsupported(other)),
        }?;

        input_stream.play()?;
        output_stream.play()?;
        status.set(StreamStatus::Running);
        info!(
            "Duplex stream running: {} in / {} out @ {} Hz",
            input.channels, output.channels, output.sample_rate
        );

        let mixer_stream = MixerStream {
            _devices: vec![input.device, output.device],
            _streams: vec![input_stream, output_stream],
            sample_rate: output.sample_rate,
            input_channels: input.channels,
            output_channels: output.channels,
            status,
            load,
            notifications,
        };

        Ok((session, mixer_stream))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output channel count, or the input channel count of an input-only
    /// stream
    pub fn channels(&self) -> usize {
        if self.output_channels > 0 {
            self.output_channels
        } else {
            self.input_channels
        }
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Collect notifications pushed since the last call
    pub fn poll_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Some(notification) = self.notifications.try_pop() {
            out.push(notification);
        }
        out
    }

    fn open(config: &SessionConfig, direction: Direction) -> MixerResult<(Session, MixerStream)> {
        let host = cpal::default_host();
        let DeviceSetup {
            device,
            sample_format,
            stream_config,
            sample_rate,
            channels,
            scratch_frames,
        } = setup_device(&host, direction, config.block_size, None)?;

        // Negotiated parameters win over the requested ones
        let (input_channels, output_channels) = match direction {
            Direction::Output => (0, channels),
            Direction::Input => (channels, 0),
        };
        let session_config = negotiated_config(config, sample_rate, input_channels, output_channels);
        let (session, executor) = Session::new(&session_config)?;

        // Measure 1 out of 10 callbacks to keep the overhead low
        let load = CallbackLoad::new(sample_rate, 10);

        let status = AtomicStreamStatus::new(StreamStatus::Starting);
        let (notification_tx, notifications) =
            create_notification_channel(NOTIFICATION_CAPACITY);
        let notification_tx = Arc::new(Mutex::new(notification_tx));

        let parts = CallbackParts {
            executor,
            channels,
            scratch_frames,
            load: load.clone(),
            status: status.clone(),
            notification_tx,
        };

        let stream = match (direction, sample_format) {
            (Direction::Output, SampleFormat::F32) => build_output::<f32>(&device, &stream_config, parts),
            (Direction::Output, SampleFormat::I16) => build_output::<i16>(&device, &stream_config, parts),
            (Direction::Output, SampleFormat::U16) => build_output::<u16>(&device, &stream_config, parts),
            (Direction::Input, SampleFormat::F32) => build_input::<f32>(&device, &stream_config, parts),
            (Direction::Input, SampleFormat::I16) => build_input::<i16>(&device, &stream_config, parts),
            (Direction::Input, SampleFormat::U16) => build_input::<u16>(&device, &stream_config, parts),
            (_, other) => return Err(unsupported(other)),
        }?;

        stream.play()?;
        status.set(StreamStatus::Running);
        info!("Stream running: {} channels @ {} Hz", channels, sample_rate);

        let mixer_stream = MixerStream {
            _devices: vec![device],
            _streams: vec![stream],
            sample_rate,
            input_channels,
            output_channels,
            status,
            load,
            notifications,
        };

        Ok((session, mixer_stream))
    }
}

impl Drop for MixerStream {
    fn drop(&mut self) {
        self.status.set(StreamStatus::Stopped);
    }
}

fn unsupported(format: SampleFormat) -> MixerError {
    MixerError::UnsupportedSampleFormat(format!("{:?}. Supported formats: F32, I16, U16", format))
}

fn setup_device(
    host: &Host,
    direction: Direction,
    block_size: Option<u32>,
    sample_rate: Option<u32>,
) -> MixerResult<DeviceSetup> {
    let device = match direction {
        Direction::Output => host.default_output_device(),
        Direction::Input => host.default_input_device(),
    }
    .ok_or(MixerError::NoDevice)?;

    info!(
        "Audio {:?} device: {}",
        direction,
        device.name().unwrap_or("Unknown".to_string())
    );

    let supported_config = match direction {
        Direction::Output => device.default_output_config()?,
        Direction::Input => device.default_input_config()?,
    };

    let sample_format = supported_config.sample_format();
    info!("Audio config: {:?}", supported_config);

    let channels = supported_config.channels() as usize;
    let mut stream_config: StreamConfig = supported_config.into();
    if let Some(rate) = sample_rate {
        stream_config.sample_rate = cpal::SampleRate(rate);
    }
    if let Some(frames) = block_size {
        stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
    }

    let scratch_frames = match stream_config.buffer_size {
        cpal::BufferSize::Fixed(size) => size as usize,
        cpal::BufferSize::Default => DEFAULT_SCRATCH_FRAMES,
    };

    Ok(DeviceSetup {
        device,
        sample_format,
        sample_rate: stream_config.sample_rate.0,
        stream_config,
        channels,
        scratch_frames,
    })
}

/// Session parameters after the devices had their say. A direction without
/// a device gets no channels, so nothing can be scheduled on it.
fn negotiated_config(
    requested: &SessionConfig,
    sample_rate: u32,
    input_channels: usize,
    output_channels: usize,
) -> SessionConfig {
    SessionConfig {
        sample_rate,
        input_channels,
        output_channels,
        ..requested.clone()
    }
}

/// Everything moved into the data callback
struct CallbackParts {
    executor: Executor,
    channels: usize,
    scratch_frames: usize,
    load: CallbackLoad,
    status: AtomicStreamStatus,
    notification_tx: Arc<Mutex<NotificationProducer>>,
}

/// Everything moved into the capture callback of a duplex stream
struct CaptureParts {
    writer: RingWriter<f32>,
    channels: usize,
    scratch_frames: usize,
    stats: EngineStats,
    status: AtomicStreamStatus,
    notification_tx: Arc<Mutex<NotificationProducer>>,
}

fn error_callback(
    status: AtomicStreamStatus,
    notification_tx: Arc<Mutex<NotificationProducer>>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        // ========== ERROR CALLBACK ==========
        // Runs outside the audio callback, I/O is fine here
        error!("Audio stream error: {}", err);
        status.set(StreamStatus::Error);

        if let Ok(mut tx) = notification_tx.try_lock() {
            let _ = tx.try_push(Notification::error(format!("Audio stream error: {}", err)));
        }
    }
}

/// Fill `block` with captured frames, padding with silence when the capture
/// side is behind. Returns the number of padded frames.
#[inline]
fn pull_captured(reader: &mut RingReader<f32>, block: &mut [f32]) -> usize {
    let channels = reader.element_len();
    let got = reader.read(block);
    block[got * channels..].fill(0.0);
    block.len() / channels - got
}

fn build_output<T>(device: &Device, config: &StreamConfig, parts: CallbackParts) -> MixerResult<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let CallbackParts {
        mut executor,
        channels,
        scratch_frames,
        load,
        status,
        notification_tx,
    } = parts;

    let mut scratch = vec![0.0f32; scratch_frames * channels];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // ========== SACRED ZONE ==========
            // No allocations, No I/O, No blocking locks
            let measure_start = load.start_measure();

            for chunk in data.chunks_mut(scratch.len()) {
                let block = &mut scratch[..chunk.len()];
                executor.process(&[], block);
                write_interleaved(block, chunk);
            }

            load.end_measure(measure_start, data.len() / channels);
            // ========== SACRED ZONE END ==========
        },
        error_callback(status, notification_tx),
        None,
    )?;

    Ok(stream)
}

fn build_input<T>(device: &Device, config: &StreamConfig, parts: CallbackParts) -> MixerResult<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let CallbackParts {
        mut executor,
        channels,
        scratch_frames,
        load,
        status,
        notification_tx,
    } = parts;

    let mut scratch = vec![0.0f32; scratch_frames * channels];

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // ========== SACRED ZONE ==========
            // No allocations, No I/O, No blocking locks
            let measure_start = load.start_measure();

            for chunk in data.chunks(scratch.len()) {
                let block = &mut scratch[..chunk.len()];
                read_interleaved(chunk, block);
                executor.process(block, &mut []);
            }

            load.end_measure(measure_start, data.len() / channels);
            // ========== SACRED ZONE END ==========
        },
        error_callback(status, notification_tx),
        None,
    )?;

    Ok(stream)
}

fn build_capture<T>(device: &Device, config: &StreamConfig, parts: CaptureParts) -> MixerResult<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let CaptureParts {
        mut writer,
        channels,
        scratch_frames,
        stats,
        status,
        notification_tx,
    } = parts;

    let mut scratch = vec![0.0f32; scratch_frames * channels];

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // ========== SACRED ZONE ==========
            for chunk in data.chunks(scratch.len()) {
                let block = &mut scratch[..chunk.len()];
                read_interleaved(chunk, block);
                let frames = block.len() / channels;
                let put = writer.write(block);
                if put < frames {
                    stats.record_overrun((frames - put) as u64);
                }
            }
            // ========== SACRED ZONE END ==========
        },
        error_callback(status, notification_tx),
        None,
    )?;

    Ok(stream)
}

fn build_duplex_output<T>(
    device: &Device,
    config: &StreamConfig,
    parts: CallbackParts,
    mut capture: RingReader<f32>,
) -> MixerResult<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let CallbackParts {
        mut executor,
        channels,
        scratch_frames,
        load,
        status,
        notification_tx,
    } = parts;

    let input_channels = capture.element_len();
    let stats = executor.engine_stats();
    let mut scratch = vec![0.0f32; scratch_frames * channels];
    let mut input_scratch = vec![0.0f32; scratch_frames * input_channels];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // ========== SACRED ZONE ==========
            // No allocations, No I/O, No blocking locks
            let measure_start = load.start_measure();

            for chunk in data.chunks_mut(scratch.len()) {
                let block = &mut scratch[..chunk.len()];
                let input = &mut input_scratch[..block.len() / channels * input_channels];
                let missing = pull_captured(&mut capture, input);
                if missing > 0 {
                    stats.record_underrun(missing as u64);
                }
                executor.process(input, block);
                write_interleaved(block, chunk);
            }

            load.end_measure(measure_start, data.len() / channels);
            // ========== SACRED ZONE END ==========
        },
        error_callback(status, notification_tx),
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_config_drops_input_channels() {
        let requested = SessionConfig::duplex(2, 2, 44100).with_queue_capacity(64);
        let config = negotiated_config(&requested, 48000, 0, 6);

        assert_eq!(config.input_channels, 0);
        assert_eq!(config.output_channels, 6);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.command_queue_capacity, 64);
    }

    #[test]
    fn test_output_session_rejects_recording() {
        use crate::session::Recorder;

        let config = negotiated_config(&SessionConfig::duplex(1, 1, 44100), 44100, 0, 2);
        let (mut session, _executor) = Session::new(&config).unwrap();
        let result = session.record_buffer(vec![0.0; 4], 1usize, 5, true);
        assert!(matches!(result, Err(MixerError::InvalidChannelMapping(_))));
    }

    #[test]
    fn test_input_config_drops_output_channels() {
        let config = negotiated_config(&SessionConfig::default(), 44100, 1, 0);
        assert_eq!(config.input_channels, 1);
        assert_eq!(config.output_channels, 0);
    }

    #[test]
    fn test_pull_captured_pads_missing_frames() {
        let (mut writer, mut reader) = RingBuffer::<f32>::with_element_len(2, 8).unwrap().split();
        writer.write(&[0.1, 0.2, 0.3, 0.4]);

        let mut block = [9.0f32; 8];
        assert_eq!(pull_captured(&mut reader, &mut block), 2);
        assert_eq!(block, [0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(reader.read_available(), 0);

        writer.write(&[0.5; 8]);
        assert_eq!(pull_captured(&mut reader, &mut block[..4]), 0);
        assert_eq!(reader.read_available(), 2);
    }

    #[test]
    fn test_duplex_blocks_feed_the_executor() {
        use crate::session::{Mixer, Recorder};
        use std::time::Duration;

        let config = negotiated_config(&SessionConfig::default(), 44100, 1, 1);
        let (mut session, mut executor) = Session::new(&config).unwrap();
        let (mut capture_tx, mut capture_rx) = RingBuffer::<f32>::with_element_len(1, 16).unwrap().split();

        let record = session.record_buffer(vec![0.0; 4], 1usize, 0, true).unwrap();
        session.play_buffer(vec![0.5f32; 4], 1usize, 0, true).unwrap();

        capture_tx.write(&[0.1, 0.2, 0.3]);
        let mut input = [0.0f32; 4];
        let mut output = [0.0f32; 4];
        assert_eq!(pull_captured(&mut capture_rx, &mut input), 1);
        executor.process(&input, &mut output);

        assert_eq!(output, [0.5; 4]);
        session.wait(record, Duration::from_millis(1)).unwrap();
        let recording = session.take_finished(record).unwrap().into_recording();
        assert_eq!(recording, Some(vec![0.1, 0.2, 0.3, 0.0]));
    }
}
